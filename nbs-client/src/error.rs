use thiserror::Error;

/// Failure reported by a block store or file store control plane.
///
/// The variants follow the classification callers act on: `NotFound` and
/// `Aborted` drive protocol decisions, everything else is passed through
/// with its status code attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer raced this request (concurrent create of the same disk).
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("control plane returned {code:?}: {message}")]
    Rpc { code: tonic::Code, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ClientError::Aborted(_))
    }

    /// Whether a transport-level retry of the same request may succeed.
    ///
    /// `Aborted` is excluded: it is a conflict that only the caller can
    /// resolve.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Rpc { code, .. } => matches!(
                code,
                tonic::Code::Unavailable | tonic::Code::ResourceExhausted
            ),
            ClientError::NotFound(_) | ClientError::Aborted(_) => false,
        }
    }
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => ClientError::NotFound(message),
            tonic::Code::Aborted => ClientError::Aborted(message),
            code => ClientError::Rpc { code, message },
        }
    }
}

impl From<tonic::transport::Error> for ClientError {
    fn from(err: tonic::transport::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = ClientError::from(tonic::Status::not_found("disk-1"));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = ClientError::from(tonic::Status::aborted("raced"));
        assert!(err.is_aborted());
        assert!(!err.is_retryable());

        let err = ClientError::from(tonic::Status::unavailable("down"));
        assert!(err.is_retryable());
        assert!(!err.is_aborted());

        let err = ClientError::from(tonic::Status::internal("boom"));
        assert_eq!(
            err,
            ClientError::Rpc {
                code: tonic::Code::Internal,
                message: "boom".to_string()
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = ClientError::from(tonic::Status::not_found("disk vol-1"));
        assert_eq!(err.to_string(), "not found: disk vol-1");
    }
}
