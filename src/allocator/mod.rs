pub mod ip;
pub mod subdomain;

pub use ip::IpAllocator;
pub use subdomain::{SubdomainAllocator, SubdomainClaim};
