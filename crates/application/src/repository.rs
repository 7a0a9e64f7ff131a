//! 存储层接口定义

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, DeliveryRecord, DeliveryState, Message, MessageBody,
    MessageContent, MessageId, RepositoryError, Timestamp, UserId,
};

/// 待追加的新消息。id 由存储层在会话内单调分配。
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub reply_to: Option<MessageId>,
    /// 接收者集合（成员去掉发送者），追加时为每人建立投递记录
    pub recipients: Vec<UserId>,
    pub created_at: Timestamp,
}

/// 消息存储。系统的事实来源。
///
/// 实现必须保证：同一会话内 id 严格递增无空洞（会话级串行化），
/// 分页在并发追加下稳定，投递状态单调不回退。
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 追加消息并为每个接收者建立 `sent` 投递记录，返回带已分配 id 的消息。
    async fn append(&self, new_message: NewMessage) -> Result<Message, RepositoryError>;

    async fn find(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<Message>, RepositoryError>;

    /// 取 `before` 之前的消息页，最新在前，边界不含 `before` 本身。
    async fn list_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 推进单个接收者的投递状态。返回是否发生实际变化；
    /// 回退请求返回 `InvalidState`。
    async fn update_status(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        recipient: UserId,
        state: DeliveryState,
        at: Timestamp,
    ) -> Result<bool, RepositoryError>;

    /// 重连对账：把该接收者所有 `sent` 记录批量推进到 `delivered`，
    /// 返回受影响的记录数。
    async fn mark_all_delivered(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;

    /// 编辑消息正文。墓碑消息和超出编辑窗口的消息返回 `InvalidState`。
    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        new_content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError>;

    /// 软删除，正文替换为墓碑。重复删除返回 `InvalidState`。
    async fn soft_delete(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<Message, RepositoryError>;

    async fn delivery_records(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError>;

    /// 某接收者对一批消息的投递状态，用于把历史页叠加成
    /// 查询者视角的状态。
    async fn recipient_states(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, DeliveryState>, RepositoryError>;
}

/// 会话目录。创建与成员管理属于外围服务，投递核心只读。
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 创建会话。单聊若同一成员对已存在则返回 `Conflict`。
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_direct(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn add_member(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError>;
}
