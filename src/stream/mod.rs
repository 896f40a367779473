pub mod backoff;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod registry;
pub mod resubscribe;

pub use client::MarketStreamClient;
pub use registry::StreamName;
