use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// Message carried by the `failed-precondition` error raised when another
/// client took over the persistence lease.
pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current tab is not in the required state to perform this operation. \
     It might be necessary to refresh the browser tab.";

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a `google.rpc.Status` JSON object (`{code, message}`).
pub fn decode_status(value: &JsonValue) -> Option<FirestoreError> {
    let status = serde_json::from_value::<StatusPayload>(value.clone()).ok()?;
    if status.code == 0 {
        return None;
    }
    let code = FirestoreErrorCode::from_grpc_code(status.code).unwrap_or(FirestoreErrorCode::Unknown);
    Some(FirestoreError::new(
        code,
        status.message.unwrap_or_else(|| format!("RPC failed with status {}", status.code)),
    ))
}

/// Errors that retrying cannot fix.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// The write RPC may abort under contention, so `aborted` is retried there.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

pub fn is_primary_lease_lost(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::FailedPrecondition && error.message() == PRIMARY_LEASE_LOST_ERROR_MSG
}

/// Persistence failures that a later attempt may get past.
pub fn is_transaction_error(error: &FirestoreError) -> bool {
    is_primary_lease_lost(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{aborted, failed_precondition};
    use serde_json::json;

    #[test]
    fn aborted_is_retryable_only_for_writes() {
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::PermissionDenied));
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
        assert!(!is_permanent_error(FirestoreErrorCode::Unauthenticated));
    }

    #[test]
    fn detects_lease_loss() {
        assert!(is_primary_lease_lost(&failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)));
        assert!(!is_primary_lease_lost(&failed_precondition("other")));
        assert!(!is_transaction_error(&aborted(PRIMARY_LEASE_LOST_ERROR_MSG)));
    }

    #[test]
    fn decodes_status_objects() {
        let error = decode_status(&json!({"code": 7, "message": "denied"})).unwrap();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(error.message(), "denied");
        assert!(decode_status(&json!({"code": 0})).is_none());
    }
}
