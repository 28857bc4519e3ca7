use uuid::Uuid;

use crate::error::{HistoryError, Result};

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Trim a required text field, rejecting empty and whitespace-only values.
pub fn require_field(field: &str, value: impl Into<String>) -> Result<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HistoryError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Accept a caller-supplied id or generate a fresh one.
pub fn id_or_generate(id: Option<Id>) -> Result<Id> {
    match id {
        Some(id) => require_field("id", id),
        None => Ok(generate_id()),
    }
}
