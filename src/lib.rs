pub mod common;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "server")]
pub mod utils;

#[cfg(feature = "client")]
pub mod client;
