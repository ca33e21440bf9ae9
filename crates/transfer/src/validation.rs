use crate::{MAX_TRANSFER_ID_LEN, TransferError};

/// Validates that a transfer identifier is safe to embed in blob names.
///
/// Accepts 1 to [`MAX_TRANSFER_ID_LEN`] characters from `[A-Za-z0-9_-]`.
/// Dots are refused so an id can never collide with the `.incomplete`
/// artifact of another id, and separators are refused so an id can never
/// escape the store directories.
pub fn validate_transfer_id(id: &str) -> Result<(), TransferError> {
    if id.is_empty() {
        return Err(TransferError::InvalidTransferId("empty id".into()));
    }

    if id.len() > MAX_TRANSFER_ID_LEN {
        return Err(TransferError::InvalidTransferId(format!(
            "id is {} bytes (max {MAX_TRANSFER_ID_LEN})",
            id.len()
        )));
    }

    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TransferError::InvalidTransferId(format!(
            "character {bad:?} not allowed in {id:?}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id() {
        assert!(validate_transfer_id("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_transfer_id("..").is_err());
        assert!(validate_transfer_id("../etc/passwd").is_err());
    }

    #[test]
    fn rejects_separators() {
        assert!(validate_transfer_id("a/b").is_err());
        assert!(validate_transfer_id("a\\b").is_err());
    }

    #[test]
    fn rejects_dots() {
        assert!(validate_transfer_id("report.incomplete").is_err());
    }

    #[test]
    fn rejects_overlong_id() {
        let id = "a".repeat(MAX_TRANSFER_ID_LEN + 1);
        assert!(validate_transfer_id(&id).is_err());
        assert!(validate_transfer_id(&id[1..]).is_ok());
    }

    #[test]
    fn accepts_uuid() {
        assert!(validate_transfer_id("0b7c2c3e-8a43-4c1f-9f3c-5d2e8b7f1a90").is_ok());
    }

    #[test]
    fn accepts_underscores() {
        assert!(validate_transfer_id("device1_backup").is_ok());
    }
}
