//! Request-safety gateway for a streaming chat completion endpoint.

pub mod admin;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod security;
pub mod upstream;

pub use config::schema::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::{Gateway, Shutdown};
pub use pipeline::Pipeline;
