use serde::Serialize;
use thiserror::Error;

use crate::common::types::{ConnectionId, DriverId, SubscriberId};

/// Errors surfaced by the registry, store and router.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayError {
    #[error("coordinate out of range: lat={lat} lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("stale update for driver {0}")]
    StaleUpdate(DriverId),

    #[error("driver {0} already has a live connection")]
    DuplicateConnection(DriverId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("malformed topic '{0}'")]
    UnknownTopic(String),

    #[error("subscriber {0} overloaded")]
    SubscriberOverloaded(SubscriberId),

    #[error("subscriber capacity exceeded")]
    CapacityExceeded,
}

impl RelayError {
    /// Stable machine-readable code sent on the `error` op.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCoordinate { .. } => "INVALID_COORDINATE",
            Self::StaleUpdate(_) => "STALE_UPDATE",
            Self::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            Self::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            Self::UnknownTopic(_) => "UNKNOWN_TOPIC",
            Self::SubscriberOverloaded(_) => "SUBSCRIBER_OVERLOADED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }
}

/// JSON error body returned by the REST surface.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase (e.g. "Bad Request").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// The request path that caused the error.
    pub path: String,
}

impl ApiError {
    fn new(status: u16, error: &str, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            status,
            error: error.to_string(),
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(400, "Bad Request", message, path)
    }

    pub fn not_found(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(404, "Not Found", message, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            RelayError::InvalidCoordinate { lat: 91.0, lng: 0.0 }.code(),
            "INVALID_COORDINATE"
        );
        assert_eq!(RelayError::CapacityExceeded.code(), "CAPACITY_EXCEEDED");
    }

    #[test]
    fn api_error_serializes_camel_case() {
        let err = ApiError::not_found("no record for driver d1", "/v1/locations/d1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "Not Found");
        assert_eq!(json["path"], "/v1/locations/d1");
    }
}
