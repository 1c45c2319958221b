pub mod config;
pub mod doh;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod server;
