//! 领域错误定义
//!
//! 按失败类别划分：凭证无效、未授权、状态不允许、目标不存在。
//! 传输层针对单个连接的推送失败不属于领域错误，由投递引擎就地处理。

use thiserror::Error;

/// 领域错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid argument: {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    /// 凭证缺失、过期或无法解析，连接不予接纳。
    #[error("invalid credential")]
    InvalidCredential,

    /// 身份有效，但不是目标会话的成员。
    #[error("not authorized")]
    NotAuthorized,

    /// 操作与实体当前状态不兼容，例如编辑已删除的消息、状态回退。
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("message not found")]
    MessageNotFound,
}

impl DomainError {
    pub fn invalid_argument(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

/// 存储层错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    /// 存储层代为执行的状态机校验失败（墓碑消息、状态回退）。
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

impl From<DomainError> for RepositoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidState { reason } => RepositoryError::InvalidState { reason },
            DomainError::MessageNotFound | DomainError::ConversationNotFound => {
                RepositoryError::NotFound
            }
            other => RepositoryError::Storage {
                message: other.to_string(),
            },
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
