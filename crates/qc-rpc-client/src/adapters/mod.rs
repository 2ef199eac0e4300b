//! Network adapters for the outbound ports.

pub mod http;
pub mod ws;

pub use http::HttpTransport;
pub use ws::WsConnector;
