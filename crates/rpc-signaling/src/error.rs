use rpc_webrtc::{ChannelError, Code, Status};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("offer {0} is no longer active")]
    InactiveOffer(String),
    #[error("no answerer for host {0} is online")]
    Offline(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("signaling exchange deadline exceeded")]
    DeadlineExceeded,
    #[error("signaling stream ended")]
    StreamEnded,
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Remote(Status),
    #[error("{}", join_errors(.0))]
    Multiple(Vec<SignalingError>),
}

fn join_errors(errors: &[SignalingError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SignalingError {
    /// Recovers a typed error from a status that crossed the wire.
    pub fn from_status(status: Status) -> Self {
        match status.code {
            Code::Canceled => SignalingError::Cancelled,
            _ => SignalingError::Remote(status),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SignalingError::Cancelled)
    }

    /// Merges the outcomes of concurrent loops. Cancellation only survives when
    /// nothing more specific went wrong.
    pub fn combine(errors: impl IntoIterator<Item = Option<SignalingError>>) -> Option<SignalingError> {
        let mut all: Vec<SignalingError> = Vec::new();
        for err in errors.into_iter().flatten() {
            match err {
                SignalingError::Multiple(inner) => all.extend(inner),
                other => all.push(other),
            }
        }
        let concrete: Vec<_> = all.iter().filter(|err| !err.is_cancelled()).cloned().collect();
        let mut unique: Vec<SignalingError> = Vec::new();
        for err in if concrete.is_empty() { all } else { concrete } {
            if !unique.contains(&err) {
                unique.push(err);
            }
        }
        match unique.len() {
            0 => None,
            1 => unique.pop(),
            _ => Some(SignalingError::Multiple(unique)),
        }
    }
}

impl From<SignalingError> for Status {
    fn from(err: SignalingError) -> Self {
        let message = err.to_string();
        match err {
            SignalingError::InactiveOffer(_) => Status::new(Code::FailedPrecondition, message),
            SignalingError::Offline(_) => Status::new(Code::DeadlineExceeded, message),
            SignalingError::Protocol(_) => Status::new(Code::InvalidArgument, message),
            SignalingError::InvalidArgument(_) => Status::new(Code::InvalidArgument, message),
            SignalingError::Backend(_) => Status::new(Code::Unavailable, message),
            SignalingError::Transport(_) => Status::new(Code::Unavailable, message),
            SignalingError::RateLimited(_) => Status::new(Code::ResourceExhausted, message),
            SignalingError::DeadlineExceeded => Status::new(Code::DeadlineExceeded, message),
            SignalingError::StreamEnded => Status::new(Code::Unavailable, message),
            SignalingError::Cancelled => Status::new(Code::Canceled, message),
            SignalingError::Remote(status) => status,
            SignalingError::Multiple(_) => Status::new(Code::Unknown, message),
        }
    }
}

impl From<Status> for SignalingError {
    fn from(status: Status) -> Self {
        SignalingError::Remote(status)
    }
}

impl From<ChannelError> for SignalingError {
    fn from(err: ChannelError) -> Self {
        SignalingError::Transport(err.to_string())
    }
}

impl From<redis::RedisError> for SignalingError {
    fn from(err: redis::RedisError) -> Self {
        SignalingError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalingError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SignalingError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for SignalingError {
    fn from(err: reqwest::Error) -> Self {
        SignalingError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn combine_prefers_concrete_errors() {
        assert_eq!(SignalingError::combine([None, None]), None);
        assert_eq!(
            SignalingError::combine([Some(SignalingError::Cancelled), None]),
            Some(SignalingError::Cancelled)
        );
        assert_eq!(
            SignalingError::combine([
                Some(SignalingError::Cancelled),
                Some(SignalingError::DeadlineExceeded)
            ]),
            Some(SignalingError::DeadlineExceeded)
        );
        let combined = SignalingError::combine([
            Some(SignalingError::Protocol("uuid mismatch".into())),
            Some(SignalingError::StreamEnded),
        ])
        .expect("error");
        assert!(matches!(combined, SignalingError::Multiple(ref errs) if errs.len() == 2));
        assert_eq!(
            combined.to_string(),
            "protocol error: uuid mismatch; signaling stream ended"
        );
    }

    #[test_timeout::timeout]
    fn maps_to_distinct_status_codes() {
        let offline: Status = SignalingError::Offline("h1".into()).into();
        assert_eq!(offline.code, Code::DeadlineExceeded);
        assert!(offline.message.contains("h1"));
        let limited: Status = SignalingError::RateLimited("Call:1.2.3.4".into()).into();
        assert_eq!(limited.code, Code::ResourceExhausted);
        let cancelled: Status = SignalingError::Cancelled.into();
        assert_eq!(cancelled.code, Code::Canceled);
        let remote = Status::new(Code::PermissionDenied, "no");
        assert_eq!(Status::from(SignalingError::from(remote.clone())), remote);
    }
}
