use crate::protocol::WireError;

/// Errors surfaced by RPC calls and method handlers.
///
/// Each variant maps to a machine-readable code that travels on the wire in
/// the `error` field of a response. Errors received from the remote side come
/// back as [`RpcError::Remote`] unless the code is one this side knows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("session is not authenticated")]
    Unauthorized,

    #[error("no such process: {0}")]
    NoSuchProcess(String),

    #[error("no such drone: {0}")]
    NoSuchDrone(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("session closed")]
    Closed,

    #[error("{0}")]
    Internal(String),

    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

impl RpcError {
    /// Machine-readable code for the wire.
    pub fn code(&self) -> &str {
        match self {
            RpcError::MethodNotFound(_) => "method_not_found",
            RpcError::InvalidParams(_) => "invalid_params",
            RpcError::Unauthorized => "unauthorized",
            RpcError::NoSuchProcess(_) => "no_such_process",
            RpcError::NoSuchDrone(_) => "no_such_drone",
            RpcError::ConnectionLost => "connection_lost",
            RpcError::Closed => "closed",
            RpcError::Internal(_) => "internal_error",
            RpcError::Remote { code, .. } => code,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let message = match self {
            RpcError::Remote { message, .. } => message.clone(),
            RpcError::MethodNotFound(detail)
            | RpcError::InvalidParams(detail)
            | RpcError::NoSuchProcess(detail)
            | RpcError::NoSuchDrone(detail)
            | RpcError::Internal(detail) => detail.clone(),
            other => other.to_string(),
        };
        WireError {
            code: self.code().to_string(),
            message,
        }
    }

    pub fn from_wire(err: WireError) -> Self {
        match err.code.as_str() {
            "method_not_found" => RpcError::MethodNotFound(err.message),
            "invalid_params" => RpcError::InvalidParams(err.message),
            "unauthorized" => RpcError::Unauthorized,
            "no_such_process" => RpcError::NoSuchProcess(err.message),
            "no_such_drone" => RpcError::NoSuchDrone(err.message),
            _ => RpcError::Remote {
                code: err.code,
                message: err.message,
            },
        }
    }
}

/// Encoding a handler's result failed. Bad params are mapped by
/// [`Call::parse`](crate::rpc::Call::parse) instead.
impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_process_survives_the_wire() {
        let err = RpcError::NoSuchProcess("deadbeef".into());
        let back = RpcError::from_wire(err.to_wire());
        assert_eq!(back, err);
    }

    #[test]
    fn unknown_codes_become_remote() {
        let back = RpcError::from_wire(WireError {
            code: "internal_error".into(),
            message: "boom".into(),
        });
        assert_eq!(
            back,
            RpcError::Remote {
                code: "internal_error".into(),
                message: "boom".into()
            }
        );
        assert_eq!(back.code(), "internal_error");
    }

    #[test]
    fn json_errors_are_internal() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = RpcError::from(err);
        assert!(matches!(err, RpcError::Internal(_)));
        assert_eq!(err.to_wire().code, "internal_error");
    }

    #[test]
    fn unauthorized_code() {
        assert_eq!(RpcError::Unauthorized.to_wire().code, "unauthorized");
    }
}
