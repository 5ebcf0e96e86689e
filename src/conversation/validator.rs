//! Payload validation and history truncation.
//!
//! Validation never short-circuits: every element is inspected and every
//! violation is collected so a caller can fix the whole payload in one pass.
//! Truncation keeps a leading system message plus the most recent turns.

use serde::Serialize;
use serde_json::Value;

use crate::config::schema::PayloadConfig;
use crate::conversation::message::{Message, Role};

/// Machine-readable validation failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    Required,
    InvalidType,
    Empty,
    TooMany,
    InvalidRole,
    TooLong,
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub code: ValidationCode,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }

    /// Caller-facing rendering used in 400 response details.
    pub fn formatted(&self) -> String {
        format!("{}: {}", self.field, self.message)
    }
}

/// Outcome of validating a raw `messages` value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn details(&self) -> Vec<String> {
        self.errors.iter().map(FieldError::formatted).collect()
    }
}

/// A payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPayload {
    pub messages: Vec<Message>,
    pub warnings: Vec<String>,
}

/// Structural and size checks for a conversation.
#[derive(Debug, Clone)]
pub struct PayloadValidator {
    max_messages: usize,
    max_content_chars: usize,
    max_history: usize,
}

impl PayloadValidator {
    pub fn new(config: &PayloadConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            max_content_chars: config.max_content_chars,
            max_history: config.max_history,
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Validate the raw `messages` value. Total: never panics, any JSON is accepted.
    pub fn validate(&self, raw: &Value) -> ValidationResult {
        self.inspect(raw).0
    }

    /// Validate and, on success, return the typed messages.
    pub fn parse(&self, raw: &Value) -> Result<ValidatedPayload, ValidationResult> {
        let (result, messages) = self.inspect(raw);
        if result.is_valid {
            Ok(ValidatedPayload {
                messages,
                warnings: result.warnings,
            })
        } else {
            Err(result)
        }
    }

    fn inspect(&self, raw: &Value) -> (ValidationResult, Vec<Message>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut messages = Vec::new();

        let items = match raw {
            Value::Null => {
                errors.push(FieldError::new(
                    "messages",
                    ValidationCode::Required,
                    "messages is required",
                ));
                return (finish(errors, warnings), messages);
            }
            Value::Array(items) => items,
            _ => {
                errors.push(FieldError::new(
                    "messages",
                    ValidationCode::InvalidType,
                    "messages must be an array",
                ));
                return (finish(errors, warnings), messages);
            }
        };

        if items.is_empty() {
            errors.push(FieldError::new(
                "messages",
                ValidationCode::Empty,
                "messages must contain at least one message",
            ));
        }
        if items.len() > self.max_messages {
            errors.push(FieldError::new(
                "messages",
                ValidationCode::TooMany,
                format!(
                    "at most {} messages are allowed, got {}",
                    self.max_messages,
                    items.len()
                ),
            ));
        } else if items.len() > self.max_history {
            warnings.push(format!(
                "conversation has {} messages; only the most recent {} will be sent",
                items.len(),
                self.max_history
            ));
        }

        for (index, item) in items.iter().enumerate() {
            if let Some(message) = self.inspect_message(index, item, &mut errors, &mut warnings) {
                messages.push(message);
            }
        }

        (finish(errors, warnings), messages)
    }

    fn inspect_message(
        &self,
        index: usize,
        item: &Value,
        errors: &mut Vec<FieldError>,
        warnings: &mut Vec<String>,
    ) -> Option<Message> {
        let field = |name: &str| format!("messages[{}].{}", index, name);

        let Some(obj) = item.as_object() else {
            errors.push(FieldError::new(
                format!("messages[{}]", index),
                ValidationCode::InvalidType,
                "message must be an object",
            ));
            return None;
        };

        let role = match obj.get("role") {
            None | Some(Value::Null) => {
                errors.push(FieldError::new(field("role"), ValidationCode::Required, "role is required"));
                None
            }
            Some(Value::String(s)) => match Role::parse(s) {
                Some(role) => Some(role),
                None => {
                    errors.push(FieldError::new(
                        field("role"),
                        ValidationCode::InvalidRole,
                        "role must be one of system, user, assistant, tool",
                    ));
                    None
                }
            },
            Some(_) => {
                errors.push(FieldError::new(
                    field("role"),
                    ValidationCode::InvalidType,
                    "role must be a string",
                ));
                None
            }
        };

        let content = match obj.get("content") {
            None | Some(Value::Null) => {
                errors.push(FieldError::new(
                    field("content"),
                    ValidationCode::Required,
                    "content is required",
                ));
                None
            }
            Some(Value::String(s)) => {
                if s.chars().count() > self.max_content_chars {
                    errors.push(FieldError::new(
                        field("content"),
                        ValidationCode::TooLong,
                        format!("content exceeds {} characters", self.max_content_chars),
                    ));
                    None
                } else {
                    if s.trim().is_empty() {
                        warnings.push(format!("messages[{}].content is empty", index));
                    }
                    Some(s.clone())
                }
            }
            Some(_) => {
                errors.push(FieldError::new(
                    field("content"),
                    ValidationCode::InvalidType,
                    "content must be a string",
                ));
                None
            }
        };

        let id = match obj.get("id") {
            None | Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(s.clone())),
            Some(_) => {
                errors.push(FieldError::new(
                    field("id"),
                    ValidationCode::InvalidType,
                    "id must be a string",
                ));
                None
            }
        };

        Some(Message {
            role: role?,
            content: content?,
            id: id?,
        })
    }

    /// Drop the oldest non-system messages until at most `max_history` remain.
    ///
    /// A system message at index 0 is always kept. Deterministic for a given input.
    pub fn truncate(&self, messages: Vec<Message>) -> Vec<Message> {
        truncate_history(messages, self.max_history)
    }
}

fn finish(errors: Vec<FieldError>, warnings: Vec<String>) -> ValidationResult {
    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Keep the leading system message (if any) and the most recent messages so
/// that the result holds at most `max` entries.
pub fn truncate_history(mut messages: Vec<Message>, max: usize) -> Vec<Message> {
    if messages.len() <= max {
        return messages;
    }

    let pinned = messages.first().is_some_and(|m| m.role == Role::System);
    if pinned && max >= 1 {
        let keep_tail = max - 1;
        let tail_start = messages.len() - keep_tail;
        let tail = messages.split_off(tail_start);
        messages.truncate(1);
        messages.extend(tail);
        messages
    } else {
        messages.split_off(messages.len() - max)
    }
}
