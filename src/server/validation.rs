use crate::server::response::ApiError;
use crate::types::{Variant, validate_variant_weights};

const MAX_FLAG_KEY_LEN: usize = 100;
const MAX_FLAG_NAME_LEN: usize = 100;

fn is_valid_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

pub fn validate_flag_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() {
        return Err(ApiError::bad_request("Flag key cannot be empty"));
    }
    if key.len() > MAX_FLAG_KEY_LEN {
        return Err(ApiError::bad_request(format!(
            "Flag key cannot exceed {MAX_FLAG_KEY_LEN} characters"
        )));
    }
    if !key.chars().all(is_valid_key_char) {
        return Err(ApiError::bad_request(
            "Key must contain only letters, numbers, underscores, and hyphens",
        ));
    }
    Ok(())
}

pub fn validate_flag_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > MAX_FLAG_NAME_LEN {
        return Err(ApiError::bad_request(format!(
            "Flag name must be between 1 and {MAX_FLAG_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_rollout_percentage(percentage: i64) -> Result<(), ApiError> {
    if !(0..=100).contains(&percentage) {
        return Err(ApiError::bad_request(
            "Rollout percentage must be between 0 and 100",
        ));
    }
    Ok(())
}

pub fn validate_variants(variants: &[Variant]) -> Result<(), ApiError> {
    validate_variant_weights(variants).map_err(ApiError::bad_request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_key_rules() {
        assert!(validate_flag_key("new-checkout_2").is_ok());
        assert!(validate_flag_key("").is_err());
        assert!(validate_flag_key("has space").is_err());
        assert!(validate_flag_key("dotted.key").is_err());
        assert!(validate_flag_key(&"k".repeat(101)).is_err());
        assert!(validate_flag_key(&"k".repeat(100)).is_ok());
    }

    #[test]
    fn test_rollout_bounds() {
        assert!(validate_rollout_percentage(0).is_ok());
        assert!(validate_rollout_percentage(100).is_ok());
        assert!(validate_rollout_percentage(101).is_err());
        assert!(validate_rollout_percentage(-1).is_err());
    }
}
