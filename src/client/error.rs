use thiserror::Error;

pub use crate::messenger::RequestError;
pub use crate::protocol::error::Error as ProtocolError;
use crate::validation::ExactlyOneError;

/// Which resource a failed request was about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestContext {
    /// Request was for a topic.
    Topic(String),

    /// Request was for a partition.
    Partition(String, i32),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] crate::connection::Error),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(
        "Server error {protocol_error:?} with message \"{}\", context: {request:?}",
        string_or_na(error_message)
    )]
    ServerError {
        /// Protocol-level error.
        protocol_error: ProtocolError,

        /// Error message provided by the broker, if any.
        error_message: Option<String>,

        /// Request context.
        request: RequestContext,

        /// Set if the error was not sent by the broker but derived from its response, e.g. a partition that is
        /// missing in a metadata response.
        is_virtual: bool,
    },

    #[error("All retries failed: {0}")]
    RetryFailed(#[from] crate::backoff::BackoffError),

    #[error("Record at offset {offset} is larger than the fetch limit of {max_bytes} bytes")]
    RecordTooLarge { offset: i64, max_bytes: i32 },
}

impl Error {
    pub(crate) fn exactly_one_topic(err: ExactlyOneError) -> Self {
        Self::InvalidResponse(format!("Expected a single topic in response: {err}"))
    }

    pub(crate) fn exactly_one_partition(err: ExactlyOneError) -> Self {
        Self::InvalidResponse(format!("Expected a single partition in response: {err}"))
    }

    /// The protocol error of a server error, if this is one.
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        match self {
            Self::ServerError { protocol_error, .. } => Some(*protocol_error),
            _ => None,
        }
    }
}

fn string_or_na(s: &Option<String>) -> &str {
    s.as_deref().unwrap_or("n/a")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = Error::ServerError {
            protocol_error: ProtocolError::NotLeaderOrFollower,
            error_message: None,
            request: RequestContext::Partition("foo".to_string(), 1),
            is_virtual: false,
        };

        assert_eq!(
            err.to_string(),
            "Server error NotLeaderOrFollower with message \"n/a\", context: Partition(\"foo\", 1)"
        );
        assert_eq!(err.protocol_error(), Some(ProtocolError::NotLeaderOrFollower));
    }
}
