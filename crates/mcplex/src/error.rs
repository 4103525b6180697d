use std::borrow::Cow;

use crate::ServiceError;
pub use crate::model::ErrorData;

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// The single error type spanning every stage of a session's life, for
/// callers that do not care which stage failed.
#[derive(Debug, thiserror::Error)]
pub enum McplexError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[cfg(feature = "client")]
    #[error("Client initialization error: {0}")]
    ClientInitialize(#[from] crate::service::ClientInitializeError),
    #[cfg(feature = "server")]
    #[error("Server initialization error: {0}")]
    ServerInitialize(#[from] crate::service::ServerInitializeError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
    #[error("Transport creation error: {error}")]
    TransportCreation {
        transport_type_name: Cow<'static, str>,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl McplexError {
    pub fn transport_creation<T: 'static>(
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        McplexError::TransportCreation {
            transport_type_name: std::any::type_name::<T>().into(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorCode;

    #[test]
    fn test_error_data_display() {
        let error = ErrorData {
            code: ErrorCode::INVALID_REQUEST,
            message: "Invalid Request".into(),
            data: None,
        };
        assert_eq!(error.to_string(), "-32600: Invalid Request");

        let error = ErrorData {
            code: ErrorCode::INVALID_REQUEST,
            message: "Invalid Request".into(),
            data: Some(serde_json::json!({"detail": "missing field"})),
        };
        assert_eq!(
            error.to_string(),
            "-32600: Invalid Request({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn test_transport_creation_error() {
        struct DummyTransport;
        let error = McplexError::transport_creation::<DummyTransport>(std::io::Error::other(
            "connection failed",
        ));
        let display = error.to_string();
        assert!(display.contains("Transport creation error"));
        match error {
            McplexError::TransportCreation {
                transport_type_name,
                ..
            } => assert!(transport_type_name.contains("DummyTransport")),
            _ => panic!("expected TransportCreation"),
        }
    }
}
