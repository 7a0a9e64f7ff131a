use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::auth::IdentityError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            // 存储层代为执行的状态机校验归入领域错误分类
            RepositoryError::InvalidState { reason } => {
                ApplicationError::Domain(DomainError::InvalidState { reason })
            }
            other => ApplicationError::Repository(other),
        }
    }
}
