/// Request-level failures reported to a client as a `ctrl` message.
/// None of these terminate the session or the topic.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed")]
    Malformed,
    #[error("authentication required")]
    AuthRequired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("topic not found")]
    TopicNotFound,
    #[error("already authenticated")]
    AlreadyAuthenticated,
    #[error("must attach first")]
    AttachFirst,
    #[error("invalid payload for this topic")]
    InvalidPayload,
    #[error("operation not allowed")]
    NotAllowed,
    #[error("internal error")]
    Internal,

    // Retryable
    #[error("topic not available")]
    TopicUnavailable,

    #[error("version not supported")]
    VersionNotSupported,
}

impl ProtocolError {
    /// Status code carried in the `ctrl` response.
    pub fn code(&self) -> u16 {
        match self {
            Self::Malformed | Self::InvalidPayload => 400,
            Self::AuthRequired => 401,
            Self::PermissionDenied => 403,
            Self::TopicNotFound => 404,
            Self::NotAllowed => 405,
            Self::AlreadyAuthenticated | Self::AttachFirst => 409,
            Self::Internal => 500,
            Self::TopicUnavailable => 503,
            Self::VersionNotSupported => 505,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TopicUnavailable)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::AuthRequired => "auth_required",
            Self::PermissionDenied => "permission_denied",
            Self::TopicNotFound => "topic_not_found",
            Self::AlreadyAuthenticated => "already_authenticated",
            Self::AttachFirst => "attach_first",
            Self::InvalidPayload => "invalid_payload",
            Self::NotAllowed => "not_allowed",
            Self::Internal => "internal",
            Self::TopicUnavailable => "topic_unavailable",
            Self::VersionNotSupported => "version_not_supported",
        }
    }
}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::TopicNotFound,
            _ => Self::Internal,
        }
    }
}

/// Failures of the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
