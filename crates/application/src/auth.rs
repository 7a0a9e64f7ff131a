//! 身份校验协作方接口
//!
//! 凭证的签发由外部身份服务负责，投递核心只消费校验结果。

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity verification failed: {0}")]
    Failure(String),
}

impl IdentityError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

/// 凭证校验接口。
///
/// 返回 `Ok(None)` 表示凭证本身无效（过期或无法解析），与
/// 校验过程本身的故障（`Err`）是不同的失败类别。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<UserId>, IdentityError>;
}
