//! Error types for minirpc.
//!
//! A single error enum covers the codec, the registry and the client so that
//! every layer can propagate with `?` and the HTTP bridge can map any failure
//! to a status code in one place.

use thiserror::Error;

/// Main error type for minirpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    // Codec errors
    #[error("Decode error: {message}")]
    Decode {
        message: String,
        /// True when the peer closed the stream between records.
        eof: bool,
    },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Write error: {message}")]
    Write { message: String },

    #[error("Codec is closed")]
    Closed,

    // Registry errors
    #[error("Service not found: {method}")]
    NotFound { method: String },

    #[error("Service already defined: {name}")]
    DuplicateService { name: String },

    #[error("Invalid service {name}: {message}")]
    InvalidService { name: String, message: String },

    #[error("Invocation of {method} failed: {message}")]
    Invocation { method: String, message: String },

    // Request errors
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// The far side answered with a non-empty `Header.error`.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for minirpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Build a decode error from a bincode failure.
    ///
    /// Only an end of stream hit before the first byte of a record
    /// (`at_boundary`) counts as a clean EOF; anything later is a truncation.
    pub(crate) fn decode(err: &bincode::Error, at_boundary: bool) -> Self {
        let eof = at_boundary
            && matches!(
                err.as_ref(),
                bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
            );
        RpcError::Decode {
            message: err.to_string(),
            eof,
        }
    }

    /// Whether this error is a clean end of stream rather than corruption.
    pub fn is_eof(&self) -> bool {
        matches!(self, RpcError::Decode { eof: true, .. })
    }

    /// Convert to an HTTP status code for the JSON bridge.
    ///
    /// - 400: the request was malformed or had the wrong shape
    /// - 404: the method does not resolve
    /// - 500: everything else (invocation and transport failures)
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::InvalidParams { .. } | RpcError::TypeMismatch { .. } => 400,

            RpcError::NotFound { .. } => 404,

            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::NotFound {
            method: "Calc.Missing".into(),
        };
        assert_eq!(err.to_string(), "Service not found: Calc.Missing");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RpcError::NotFound {
                method: "x.y".into()
            }
            .status_code(),
            404
        );
        assert_eq!(
            RpcError::InvalidParams {
                message: "bad".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            RpcError::Invocation {
                method: "Calc.Div".into(),
                message: "divide by zero".into()
            }
            .status_code(),
            500
        );
    }

    fn unexpected_eof() -> bincode::Error {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        Box::new(bincode::ErrorKind::Io(io))
    }

    #[test]
    fn test_decode_eof_detection() {
        assert!(RpcError::decode(&unexpected_eof(), true).is_eof());

        let err: bincode::Error = Box::new(bincode::ErrorKind::SizeLimit);
        assert!(!RpcError::decode(&err, true).is_eof());
    }

    #[test]
    fn test_eof_inside_record_is_not_clean() {
        let decoded = RpcError::decode(&unexpected_eof(), false);
        assert!(!decoded.is_eof());
        assert!(matches!(decoded, RpcError::Decode { eof: false, .. }));
    }
}
