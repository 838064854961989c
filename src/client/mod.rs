//! HTTP client plumbing for the API server connection

pub mod ssl;

pub use ssl::TlsSettings;
