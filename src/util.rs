use sha2::{Digest, Sha256};

/// Content hash of an ordered list of address strings.
///
/// Entries are newline-separated before hashing so `["ab", "c"]` and
/// `["a", "bc"]` hash differently.
pub fn hash_addresses<I, S>(addresses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for address in addresses {
        hasher.update(address.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
