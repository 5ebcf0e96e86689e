//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway config file (TOML), --config or GATEWAY_CONFIG
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all problems collected)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! Moderation policy file (TOML, versioned):
//!     watcher.rs detects change
//!     → ModerationPolicy::load + compile
//!     → atomic swap inside ContentModerator
//!     → invalid policy: logged, previous policy kept
//! ```
//!
//! # Design Decisions
//! - Gateway config is immutable once loaded; only the policy hot-reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{
    AdminConfig, GatewayConfig, ListenerConfig, LogFormat, ObservabilityConfig, PayloadConfig,
    RateLimitConfig, UpstreamConfig,
};
