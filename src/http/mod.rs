//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request-id / trace / timeout layers)
//!     → request.rs (request ID generation)
//!     → chat.rs (admission pipeline, upstream dispatch)
//!     → response.rs (rate-limit headers, JSON rejections, SSE stream)
//!     → Send to client
//! ```

pub mod chat;
pub mod request;
pub mod response;
pub mod server;

pub use request::{UuidRequestId, X_REQUEST_ID};
pub use server::{AppState, GatewayServer};
