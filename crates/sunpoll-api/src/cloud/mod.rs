// Cloud portal link
//
// Session-cookie HTTP API relayed by the vendor portal. One `CloudClient`
// per account; one `CloudTransport` per device bound to it.

pub mod client;
pub mod http;
pub mod models;
pub mod transport;

pub use client::CloudClient;
pub use http::{HttpConfig, TlsMode};
pub use transport::CloudTransport;
