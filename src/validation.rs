//! Input validation for notecore.
//!
//! This module provides validation functions for all user inputs.
//! All validators return NoteError::Validation on failure.

use uuid::Uuid;

use crate::error::{NoteError, NoteResult};
use crate::models::Note;

pub const MAX_TITLE_LENGTH: usize = 500;
pub const MAX_BODY_LENGTH: usize = 100_000; // 100KB of text
pub const MAX_COLOR_LENGTH: usize = 32;
pub const MAX_QUERY_LENGTH: usize = 500;

/// Validate and convert a UUID hex string to Uuid.
pub fn validate_uuid_hex(value: &str, field_name: &str) -> NoteResult<Uuid> {
    // Accept both hyphenated and non-hyphenated formats
    let cleaned = value.replace('-', "");
    Uuid::parse_str(&cleaned)
        .map_err(|e| NoteError::validation(field_name, format!("invalid UUID format: {}", e)))
}

/// Validate a note ID.
pub fn validate_note_id(note_id: &str) -> NoteResult<Uuid> {
    validate_uuid_hex(note_id, "note_id")
}

pub fn validate_title(title: &str) -> NoteResult<()> {
    let len = title.chars().count();
    if len > MAX_TITLE_LENGTH {
        return Err(NoteError::validation(
            "title",
            format!("cannot exceed {} characters (got {})", MAX_TITLE_LENGTH, len),
        ));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> NoteResult<()> {
    if body.len() > MAX_BODY_LENGTH {
        return Err(NoteError::validation(
            "body",
            format!("cannot exceed {} bytes (got {})", MAX_BODY_LENGTH, body.len()),
        ));
    }
    Ok(())
}

/// Validate a note colour.
///
/// Colours are either a palette name (`"default"`, `"yellow"`, ...) made of
/// lowercase ASCII letters and dashes, or a `#rrggbb` hex value.
pub fn validate_color(color: &str) -> NoteResult<()> {
    if color.is_empty() || color.len() > MAX_COLOR_LENGTH {
        return Err(NoteError::validation(
            "color",
            format!("must be 1 to {} characters", MAX_COLOR_LENGTH),
        ));
    }

    if let Some(hex) = color.strip_prefix('#') {
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NoteError::validation("color", "hex colours must be '#rrggbb'"));
        }
        return Ok(());
    }

    if !color.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
        return Err(NoteError::validation(
            "color",
            "palette names may only contain lowercase letters and '-'",
        ));
    }
    Ok(())
}

/// Validate a search query used by list filters.
pub fn validate_query(query: Option<&str>) -> NoteResult<()> {
    if let Some(q) = query {
        if q.len() > MAX_QUERY_LENGTH {
            return Err(NoteError::validation(
                "query",
                format!("cannot exceed {} characters", MAX_QUERY_LENGTH),
            ));
        }
    }
    Ok(())
}

/// Validate every user-editable field of a note before it is written.
pub fn validate_note(note: &Note) -> NoteResult<()> {
    if note.id.is_nil() {
        return Err(NoteError::validation("id", "cannot be the nil UUID"));
    }
    validate_title(&note.title)?;
    validate_body(&note.body)?;
    validate_color(&note.color)?;
    if note.version < 0 {
        return Err(NoteError::validation("version", "cannot be negative"));
    }
    Ok(())
}
