pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod plugin;
pub mod proxy;
pub mod server;
pub mod tls;
