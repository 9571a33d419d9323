//! Email-address validation port.
//!
//! Notification addresses on publish/pull requests are normalized before
//! being placed into task payloads. The default implementation is a
//! lightweight syntactic check; a stricter validator can be substituted
//! through the trait.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};

pub trait MailValidator: Send + Sync {
    /// Return the normalized form of the address, or a validation error.
    fn normalize(&self, address: &str) -> AppResult<String>;
}

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("address regex")
});

/// Syntactic validator: one `@`, a dotted domain, no whitespace. The domain
/// part is lowercased during normalization.
pub struct RegexMailValidator;

impl MailValidator for RegexMailValidator {
    fn normalize(&self, address: &str) -> AppResult<String> {
        let trimmed = address.trim();
        if !ADDRESS_RE.is_match(trimmed) {
            return Err(AppError::validation(
                "invalid_email".to_string(),
                format!("'{}' is not a valid email address", address),
            ));
        }
        let at = trimmed.rfind('@').ok_or_else(|| {
            AppError::validation(
                "invalid_email".to_string(),
                format!("'{}' is not a valid email address", address),
            )
        })?;
        let (local, domain) = trimmed.split_at(at);
        Ok(format!("{}{}", local, domain.to_lowercase()))
    }
}
