//! Conversation payload subsystem.
//!
//! # Data Flow
//! ```text
//! raw JSON `messages` value
//!     → validator.rs (structure, roles, length bounds; all errors collected)
//!     → Vec<Message> (typed, chronological)
//!     → validator.rs truncate (leading system message + most recent turns)
//! ```

pub mod message;
pub mod validator;

pub use message::{Message, Role};
pub use validator::{
    FieldError, PayloadValidator, ValidatedPayload, ValidationCode, ValidationResult,
};
