//! Free-text field validation for intake answers
//!
//! Pure functions, no state. Every rejection names the field so the caller can
//! pick the right re-prompt.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_NAME_CHARS: usize = 120;
const MAX_EMAIL_CHARS: usize = 254;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-ZáéíóúÁÉÍÓÚüÜñÑ\s.'-]+$").expect("valid name regex")
});

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+\d{1,3}\s?\d{5,12}$").expect("valid phone regex"));

/// Field an answer was collected for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Email,
    Phone,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Name => "name",
            Field::Email => "email",
            Field::Phone => "phone",
        })
    }
}

/// Why an answer was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    TooLong,
    BadFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} rejected: {reason:?}")]
pub struct ValidationRejected {
    pub field: Field,
    pub reason: RejectReason,
}

impl ValidationRejected {
    fn new(field: Field, reason: RejectReason) -> Self {
        Self { field, reason }
    }
}

/// Validate a full name. Returns the trimmed name.
pub fn validate_name(input: &str) -> Result<&str, ValidationRejected> {
    let name = input.trim();
    if name.is_empty() {
        return Err(ValidationRejected::new(Field::Name, RejectReason::Empty));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationRejected::new(Field::Name, RejectReason::TooLong));
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidationRejected::new(Field::Name, RejectReason::BadFormat));
    }
    Ok(name)
}

/// Validate an email address. Returns the trimmed address.
pub fn validate_email(input: &str) -> Result<&str, ValidationRejected> {
    let email = input.trim();
    if email.is_empty() {
        return Err(ValidationRejected::new(Field::Email, RejectReason::Empty));
    }
    if email.chars().count() > MAX_EMAIL_CHARS {
        return Err(ValidationRejected::new(Field::Email, RejectReason::TooLong));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationRejected::new(Field::Email, RejectReason::BadFormat));
    }
    Ok(email)
}

/// The literal "no" declines to share an email.
pub fn is_email_opt_out(input: &str) -> bool {
    input.trim().eq_ignore_ascii_case("no")
}

/// Validate an international phone number (`+57 3001234567`).
///
/// No dialogue step asks for a phone today; the number is derived from the
/// correspondent id instead. Kept for adapters that collect it explicitly.
#[allow(dead_code)]
pub fn validate_phone(input: &str) -> Result<&str, ValidationRejected> {
    let phone = input.trim();
    if phone.is_empty() {
        return Err(ValidationRejected::new(Field::Phone, RejectReason::Empty));
    }
    if !PHONE_RE.is_match(phone) {
        return Err(ValidationRejected::new(Field::Phone, RejectReason::BadFormat));
    }
    Ok(phone)
}

/// Bare phone number from a correspondent id such as `573001234567@c.us`.
pub fn phone_from_correspondent(correspondent: &str) -> Option<&str> {
    let local = correspondent.split('@').next().unwrap_or_default().trim();
    if local.is_empty() {
        None
    } else {
        Some(local)
    }
}
