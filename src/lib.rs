pub mod common;
pub mod config;
pub mod geo;
pub mod monitoring;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;
