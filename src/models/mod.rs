pub mod descriptor;
pub mod upstream;

pub use descriptor::{format_host_port, parse_lines, Scheme, UpstreamDescriptor};
pub use upstream::{AvailableSnapshot, Upstream, UpstreamPool};
