pub mod allocator;
pub mod api;
pub mod bootstrap;
pub mod controller;
pub mod data;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod guard;
pub mod machinery;
pub mod notify;
pub mod platform;
pub mod resources;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
