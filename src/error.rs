use thiserror::Error;

/// 统一的核心错误类型 / Unified core error type
///
/// 错误从不跨越actor边界抛出，总是作为值返回
/// Errors never cross actor boundaries as panics, always returned as values
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("delivery error: {kind}: {message}")]
    Delivery { kind: String, message: String },

    #[error("scan service error: {0}")]
    Scan(String),

    #[error("threat detected: {signature}")]
    ThreatDetected { signature: String },

    #[error("transform error: {0}")]
    Transform(String),

    #[error("actor unavailable: {name}")]
    ActorUnavailable { name: String },

    #[error("not a member: user {user_id} in {entity}")]
    NotMember { entity: String, user_id: String },

    #[error("unknown job: {job_id}")]
    UnknownJob { job_id: String },

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn storage<T: Into<String>>(message: T) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn delivery<T: Into<String>, U: Into<String>>(kind: T, message: U) -> Self {
        Self::Delivery {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// 是否为可重试的瞬态错误 / Whether this is a retryable transient error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Storage { .. } | CoreError::Delivery { .. } | CoreError::Scan(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
