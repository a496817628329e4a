//! Error types for 0x.ship core operations

use thiserror::Error;

/// Failure to turn a wire event into a [`crate::DomainEvent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("Unknown event name: {name}")]
    UnknownEvent { name: String },

    #[error("Malformed payload for {name}: {reason}")]
    MalformedPayload { name: String, reason: String },
}

/// Input rejected before any state is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors reading or patching a cached payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Expected a JSON object for {what}")]
    NotAnObject { what: String },

    #[error("Expected a JSON array for {what}")]
    NotAnArray { what: String },

    #[error("Field {field} has an unexpected shape: {reason}")]
    BadField { field: String, reason: String },
}

/// Master error type for core operations.
#[derive(Debug, Clone, Error)]
pub enum ShipError {
    #[error("Event error: {0}")]
    Event(#[from] EventDecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Result type alias for core operations.
pub type ShipResult<T> = Result<T, ShipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_decode_error_display() {
        let err = EventDecodeError::UnknownEvent {
            name: "project:archived".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unknown event"));
        assert!(msg.contains("project:archived"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidValue {
            field: "message".to_string(),
            reason: "must not be blank".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("message"));
        assert!(msg.contains("must not be blank"));
    }

    #[test]
    fn test_ship_error_from_variants() {
        let event = ShipError::from(EventDecodeError::MalformedPayload {
            name: "vote:cast".to_string(),
            reason: "missing project_id".to_string(),
        });
        assert!(matches!(event, ShipError::Event(_)));

        let validation = ShipError::from(ValidationError::RequiredFieldMissing {
            field: "recipient_id".to_string(),
        });
        assert!(matches!(validation, ShipError::Validation(_)));

        let payload = ShipError::from(PayloadError::NotAnArray {
            what: "conversation".to_string(),
        });
        assert!(matches!(payload, ShipError::Payload(_)));
    }
}
