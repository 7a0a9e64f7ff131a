//! 成员关系协作方接口
//!
//! 会话成员的增删由会话目录服务负责，投递核心只读取成员集
//! 来计算接收者和做准入检查。

use async_trait::async_trait;
use domain::{ConversationId, RepositoryError, UserId};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, RepositoryError>;

    async fn members_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError>;
}
