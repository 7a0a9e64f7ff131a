//! 投递扇出引擎
//!
//! 接收入站消息，先落库再扇出：持久化是唯一的耐久点，
//! 之后对任何连接的推送失败都只拆除那一个连接，不回滚消息。

use std::sync::Arc;
use std::time::Duration;

use domain::{
    ChatEvent, ConversationId, DeliveryState, DomainError, Message, MessageBody, MessageContent,
    MessageId, UserId,
};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::membership::MembershipDirectory;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, LiveConnection};
use crate::repository::{MessageRepository, NewMessage};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub reply_to: Option<MessageId>,
}

pub struct ChatServiceDependencies {
    pub message_repository: Arc<dyn MessageRepository>,
    pub membership: Arc<dyn MembershipDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub clock: Arc<dyn Clock>,
    /// 单个连接推送的确认窗口，超时按传输失败处理
    pub push_timeout: Duration,
}

pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    /// 提交一条新消息。
    ///
    /// 1. 校验发送者是目标会话成员
    /// 2. 追加到消息存储（耐久点）
    /// 3. 接收者集合 = 成员 - 发送者
    /// 4. 向每个接收者的在作用域内的活跃连接推送
    /// 5. 有活跃连接的接收者立即标记 delivered，离线的保持 sent
    /// 6. 返回持久化的消息作为发送确认；发送者自己不走扇出路径
    pub async fn submit(&self, request: SendMessageRequest) -> Result<Message, ApplicationError> {
        let members = self
            .deps
            .membership
            .members_of(request.conversation_id)
            .await?;
        if !members.contains(&request.sender_id) {
            tracing::warn!(
                sender_id = %request.sender_id,
                conversation_id = %request.conversation_id,
                "消息提交被拒绝：发送者不是会话成员"
            );
            return Err(DomainError::NotAuthorized.into());
        }

        if let Some(reply_to) = request.reply_to {
            let target = self
                .deps
                .message_repository
                .find(request.conversation_id, reply_to)
                .await?
                .ok_or(DomainError::MessageNotFound)?;
            if !target.can_be_replied_to() {
                return Err(DomainError::invalid_state(
                    "cannot reply to a deleted message",
                )
                .into());
            }
        }

        let recipients: Vec<UserId> = members
            .into_iter()
            .filter(|member| *member != request.sender_id)
            .collect();

        let stored = self
            .deps
            .message_repository
            .append(NewMessage {
                conversation_id: request.conversation_id,
                sender_id: request.sender_id,
                body: request.body,
                reply_to: request.reply_to,
                recipients: recipients.clone(),
                created_at: self.deps.clock.now(),
            })
            .await?;

        tracing::info!(
            conversation_id = %stored.conversation_id,
            message_id = %stored.id,
            recipient_count = recipients.len(),
            "消息已持久化，开始扇出"
        );

        self.fan_out(&stored, &recipients).await;

        // 确认里带上扇出后的最新聚合状态
        let acked = self
            .deps
            .message_repository
            .find(stored.conversation_id, stored.id)
            .await?
            .unwrap_or(stored);
        Ok(acked)
    }

    /// 向所有接收者并发扇出。接收者之间的推送顺序不作保证，
    /// 单个连接的出站流内部由通道保序。
    async fn fan_out(&self, message: &Message, recipients: &[UserId]) {
        let pushes = recipients
            .iter()
            .map(|recipient| self.deliver_to(*recipient, message));
        futures::future::join_all(pushes).await;
    }

    async fn deliver_to(&self, recipient: UserId, message: &Message) {
        let connections = self
            .deps
            .registry
            .scoped_connections(recipient, message.conversation_id)
            .await;
        if connections.is_empty() {
            // 没有在作用域内的连接，保持 sent，等接收者下次打开会话对账
            return;
        }

        if let Err(err) = self
            .deps
            .message_repository
            .update_status(
                message.conversation_id,
                message.id,
                recipient,
                DeliveryState::Delivered,
                self.deps.clock.now(),
            )
            .await
        {
            tracing::warn!(
                message_id = %message.id,
                recipient = %recipient,
                error = %err,
                "标记 delivered 失败"
            );
        }

        // 推送给接收者的副本反映其自身的投递状态
        let mut pushed = message.clone();
        pushed.status = DeliveryState::Delivered;
        let event = ChatEvent::Message { message: pushed };

        let sends = connections
            .into_iter()
            .map(|connection| self.push(connection, event.clone()));
        futures::future::join_all(sends).await;
    }

    /// 推送一个事件到单个连接。超时或通道关闭按传输失败处理：
    /// 拆除该连接，不影响其他接收者，也不上报给发送者。
    async fn push(&self, connection: LiveConnection, event: ChatEvent) {
        if let Err(err) = connection
            .outbound
            .send_timeout(event, self.deps.push_timeout)
            .await
        {
            tracing::warn!(
                user_id = %connection.token.user_id(),
                scope = %connection.scope,
                error = %err,
                "推送失败，拆除连接"
            );
            self.deps.registry.unregister(connection.token).await;
        }
    }

    /// 拉取历史消息页。副作用：把该用户所有 `sent` 投递记录
    /// 对账为 `delivered`（重连补投的语义）。
    pub async fn fetch_history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, ApplicationError> {
        if !self
            .deps
            .membership
            .is_member(user_id, conversation_id)
            .await?
        {
            return Err(DomainError::NotAuthorized.into());
        }

        let reconciled = self
            .deps
            .message_repository
            .mark_all_delivered(conversation_id, user_id, self.deps.clock.now())
            .await?;
        if reconciled > 0 {
            tracing::debug!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                reconciled,
                "重连对账：sent 记录已推进为 delivered"
            );
        }

        let mut page = self
            .deps
            .message_repository
            .list_before(conversation_id, before, limit)
            .await?;

        // 历史页叠加成查询者视角：寄给该用户的消息显示其本人的投递状态
        let addressed: Vec<MessageId> = page
            .iter()
            .filter(|message| message.sender_id != user_id)
            .map(|message| message.id)
            .collect();
        if !addressed.is_empty() {
            let states = self
                .deps
                .message_repository
                .recipient_states(conversation_id, user_id, &addressed)
                .await?;
            for message in &mut page {
                if let Some(state) = states.get(&message.id) {
                    message.status = *state;
                }
            }
        }

        Ok(page)
    }

    /// 接收者主动确认投递状态（delivered 或 read）。
    pub async fn update_status(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryState,
    ) -> Result<(), ApplicationError> {
        if status == DeliveryState::Sent {
            return Err(DomainError::invalid_state("status cannot be reset to sent").into());
        }
        if !self
            .deps
            .membership
            .is_member(user_id, conversation_id)
            .await?
        {
            return Err(DomainError::NotAuthorized.into());
        }

        let changed = self
            .deps
            .message_repository
            .update_status(
                conversation_id,
                message_id,
                user_id,
                status,
                self.deps.clock.now(),
            )
            .await?;

        if changed {
            let event = ChatEvent::StatusUpdate {
                conversation_id,
                message_id,
                user_id,
                status,
            };
            self.broadcast_to_scope(conversation_id, Some(user_id), event)
                .await;
        }
        Ok(())
    }

    /// 编辑消息。只有原发送者可以编辑。
    pub async fn edit_message(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        new_content: MessageContent,
    ) -> Result<Message, ApplicationError> {
        let existing = self
            .deps
            .message_repository
            .find(conversation_id, message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;
        if existing.sender_id != user_id {
            return Err(DomainError::NotAuthorized.into());
        }

        let updated = self
            .deps
            .message_repository
            .edit(conversation_id, message_id, new_content, self.deps.clock.now())
            .await?;

        self.broadcast_to_scope(
            conversation_id,
            Some(user_id),
            ChatEvent::MessageEdited {
                message: updated.clone(),
            },
        )
        .await;
        Ok(updated)
    }

    /// 软删除消息。只有原发送者可以删除。
    pub async fn delete_message(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Message, ApplicationError> {
        let existing = self
            .deps
            .message_repository
            .find(conversation_id, message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;
        if existing.sender_id != user_id {
            return Err(DomainError::NotAuthorized.into());
        }

        let deleted = self
            .deps
            .message_repository
            .soft_delete(conversation_id, message_id, self.deps.clock.now())
            .await?;

        self.broadcast_to_scope(
            conversation_id,
            Some(user_id),
            ChatEvent::MessageDeleted {
                conversation_id,
                message_id,
            },
        )
        .await;
        Ok(deleted)
    }

    /// 正在输入指示。瞬态广播：没有存储状态、没有投递保证、
    /// 不重试。调用方是已通过会话门的连接，不再做成员校验。
    pub async fn notify_typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) {
        let event = ChatEvent::Typing {
            conversation_id,
            user_id,
            is_typing,
        };

        let Ok(members) = self.deps.membership.members_of(conversation_id).await else {
            return;
        };
        for member in members {
            if member == user_id {
                continue;
            }
            for connection in self
                .deps
                .registry
                .scoped_connections(member, conversation_id)
                .await
            {
                // 丢失的 typing 事件不是错误
                let _ = connection.outbound.try_send(event.clone());
            }
        }
    }

    /// 向会话内其他成员广播某用户的上线/下线。
    pub async fn broadcast_presence(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_online: bool,
    ) {
        let event = ChatEvent::UserStatus {
            user_id,
            is_online,
            last_seen: self.deps.presence.last_seen(user_id),
        };
        self.broadcast_to_scope(conversation_id, Some(user_id), event)
            .await;
    }

    /// 推送事件到会话作用域内除 `exclude` 外所有成员的活跃连接。
    async fn broadcast_to_scope(
        &self,
        conversation_id: ConversationId,
        exclude: Option<UserId>,
        event: ChatEvent,
    ) {
        let members = match self.deps.membership.members_of(conversation_id).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(conversation_id = %conversation_id, error = %err, "广播失败：读取成员集出错");
                return;
            }
        };

        let mut pushes = Vec::new();
        for member in members {
            if Some(member) == exclude {
                continue;
            }
            for connection in self
                .deps
                .registry
                .scoped_connections(member, conversation_id)
                .await
            {
                pushes.push(self.push(connection, event.clone()));
            }
        }
        futures::future::join_all(pushes).await;
    }
}
