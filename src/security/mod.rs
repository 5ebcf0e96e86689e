//! Security subsystem: admission and content screening.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → identity.rs (forwarded address / peer → ClientIdentity)
//!     → rate_limit.rs (fixed-window budget per identity, shared store)
//!     → [payload validation, see conversation/]
//!     → moderation.rs (per-message verdicts against the active policy)
//!     → sanitize.rs (strip injection patterns, fixpoint)
//!     → Pass to upstream
//! ```
//!
//! # Design Decisions
//! - Rate-limit state is the only cross-request mutable state
//! - Moderation policy is data, swapped atomically on reload
//! - A single blocked message rejects the whole request

pub mod identity;
pub mod moderation;
pub mod rate_limit;
pub mod sanitize;

pub use identity::{ClientIdentifier, ClientIdentity, RequestMetadata};
pub use moderation::{ContentModerator, ModerationAction, ModerationPolicy, ModerationResult};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use sanitize::InjectionSanitizer;
