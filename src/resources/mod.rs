pub mod identity;
pub mod lease;
pub mod machine;
pub mod notification;
pub mod subdomain;
