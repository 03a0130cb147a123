mod handler;

pub use handler::{HttpProtocolHandler, WorkPhase};
