//! Input validation for registration requests.
//!
//! Pure syntactic checks — the RECEIVED → VALIDATED transition. Duplicate
//! and collision checks against the ledger and the server happen later in
//! the orchestrator.

use crate::core::error::{AppError, AppResult};

/// Maximum username length accepted by TeamTalk servers.
pub const MAX_USERNAME_LEN: usize = 64;

/// Minimum password length we are willing to put into an account.
pub const MIN_PASSWORD_LEN: usize = 4;

/// Maximum password length.
pub const MAX_PASSWORD_LEN: usize = 128;

/// Validate a requested username.
///
/// The error payload is a fluent message key; front-ends render it in the
/// requester's language.
pub fn validate_username(username: &str) -> AppResult<()> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("error-username-empty".to_string()));
    }
    if trimmed.len() > MAX_USERNAME_LEN {
        return Err(AppError::Validation("error-username-too-long".to_string()));
    }
    if trimmed != username {
        return Err(AppError::Validation("error-username-whitespace".to_string()));
    }
    if username.chars().any(|c| c.is_control()) {
        return Err(AppError::Validation("error-username-invalid-chars".to_string()));
    }
    Ok(())
}

/// Validate a password. The password itself is never logged or echoed.
pub fn validate_password(password: &str) -> AppResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation("error-password-too-short".to_string()));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(AppError::Validation("error-password-too-long".to_string()));
    }
    if password.chars().any(|c| c.is_control()) {
        return Err(AppError::Validation("error-password-invalid-chars".to_string()));
    }
    Ok(())
}

/// Validate a language code against the supported set.
pub fn validate_language(code: &str) -> AppResult<()> {
    if crate::i18n::is_language_supported(code).is_none() {
        return Err(AppError::Validation("error-unknown-language".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("alice_123").is_ok());
    }

    #[test]
    fn rejects_empty_and_padded_usernames() {
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username(" alice").is_err());
        assert!(validate_username("alice ").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_username("ali\x00ce").is_err());
        assert!(validate_password("pa\nssword").is_err());
    }

    #[test]
    fn password_length_policy() {
        assert!(validate_password("abc").is_err());
        assert!(validate_password("Secr3t!").is_ok());
        assert!(validate_password(&"x".repeat(MAX_PASSWORD_LEN + 1)).is_err());
    }

    #[test]
    fn known_language_codes() {
        assert!(validate_language("en").is_ok());
        assert!(validate_language("ru").is_ok());
        assert!(validate_language("xx").is_err());
    }
}
