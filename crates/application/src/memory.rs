//! 内存实现的存储层（用于测试和单机部署）
//!
//! 每个会话一把锁：id 分配和追加顺序在会话内串行化，
//! 不相关的会话各自推进。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    normalize_pair, Conversation, ConversationId, ConversationKind, DeliveryRecord,
    DeliveryState, Message, MessageContent, MessageId, RepositoryError, Timestamp, UserId,
};
use tokio::sync::{Mutex, RwLock};

use crate::membership::MembershipDirectory;
use crate::repository::{ConversationRepository, MessageRepository, NewMessage};

/// 单个会话的消息日志和投递记录。
#[derive(Default)]
struct ConversationLog {
    next_id: i64,
    messages: BTreeMap<i64, Message>,
    records: HashMap<(i64, UserId), DeliveryRecord>,
}

impl ConversationLog {
    /// 聚合状态取所有接收者记录的最小值。
    fn recompute_aggregate(&mut self, message_id: MessageId) {
        let aggregate = self
            .records
            .iter()
            .filter(|((id, _), _)| *id == message_id.value())
            .map(|(_, record)| record.state)
            .min();

        if let Some(state) = aggregate {
            if let Some(message) = self.messages.get_mut(&message_id.value()) {
                message.status = state;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    logs: RwLock<HashMap<ConversationId, Arc<Mutex<ConversationLog>>>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn log_for(&self, conversation_id: ConversationId) -> Arc<Mutex<ConversationLog>> {
        {
            let logs = self.logs.read().await;
            if let Some(log) = logs.get(&conversation_id) {
                return log.clone();
            }
        }
        let mut logs = self.logs.write().await;
        logs.entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(ConversationLog::default())))
            .clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn append(&self, new_message: NewMessage) -> Result<Message, RepositoryError> {
        let log = self.log_for(new_message.conversation_id).await;
        let mut log = log.lock().await;

        log.next_id += 1;
        let id = MessageId::new(log.next_id);

        let message = Message::new(
            id,
            new_message.conversation_id,
            new_message.sender_id,
            new_message.body,
            new_message.reply_to,
            new_message.created_at,
        );

        for recipient in &new_message.recipients {
            log.records.insert(
                (id.value(), *recipient),
                DeliveryRecord::new_sent(id, *recipient, new_message.created_at),
            );
        }
        log.messages.insert(id.value(), message.clone());

        Ok(message)
    }

    async fn find(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<Message>, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;
        Ok(log.messages.get(&message_id.value()).cloned())
    }

    async fn list_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;

        let page = match before {
            Some(boundary) => log
                .messages
                .range(..boundary.value())
                .rev()
                .take(limit as usize)
                .map(|(_, message)| message.clone())
                .collect(),
            None => log
                .messages
                .values()
                .rev()
                .take(limit as usize)
                .cloned()
                .collect(),
        };
        Ok(page)
    }

    async fn update_status(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        recipient: UserId,
        state: DeliveryState,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let mut log = log.lock().await;

        if !log.messages.contains_key(&message_id.value()) {
            return Err(RepositoryError::NotFound);
        }
        let record = log
            .records
            .get_mut(&(message_id.value(), recipient))
            .ok_or(RepositoryError::NotFound)?;

        let changed = record.advance(state, at).map_err(RepositoryError::from)?;
        if changed {
            log.recompute_aggregate(message_id);
        }
        Ok(changed)
    }

    async fn mark_all_delivered(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let mut log = log.lock().await;

        let mut touched = Vec::new();
        for ((id, user), record) in log.records.iter_mut() {
            if *user == recipient && record.state == DeliveryState::Sent {
                record.state = DeliveryState::Delivered;
                record.updated_at = at;
                touched.push(MessageId::new(*id));
            }
        }
        for id in &touched {
            log.recompute_aggregate(*id);
        }
        Ok(touched.len() as u64)
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        new_content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let mut log = log.lock().await;

        let message = log
            .messages
            .get_mut(&message_id.value())
            .ok_or(RepositoryError::NotFound)?;
        message
            .edit(new_content, at)
            .map_err(RepositoryError::from)?;
        Ok(message.clone())
    }

    async fn soft_delete(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let mut log = log.lock().await;

        let message = log
            .messages
            .get_mut(&message_id.value())
            .ok_or(RepositoryError::NotFound)?;
        message.soft_delete(at).map_err(RepositoryError::from)?;
        Ok(message.clone())
    }

    async fn delivery_records(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;
        Ok(log
            .records
            .iter()
            .filter(|((id, _), _)| *id == message_id.value())
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn recipient_states(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, DeliveryState>, RepositoryError> {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;
        Ok(message_ids
            .iter()
            .filter_map(|id| {
                log.records
                    .get(&(id.value(), recipient))
                    .map(|record| (*id, record.state))
            })
            .collect())
    }
}

/// 内存实现的会话目录。
#[derive(Default)]
pub struct MemoryConversationRepository {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut conversations = self.conversations.write().await;

        if let Some(pair) = conversation.direct_pair() {
            let exists = conversations
                .values()
                .any(|existing| existing.direct_pair() == Some(pair));
            if exists {
                return Err(RepositoryError::Conflict);
            }
        }
        if conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }

        conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id).cloned())
    }

    async fn find_direct(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let pair = normalize_pair(a, b);
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .find(|conversation| {
                conversation.kind == ConversationKind::Direct
                    && conversation.direct_pair() == Some(pair)
            })
            .cloned())
    }

    async fn add_member(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        conversation
            .add_member(user_id)
            .map_err(RepositoryError::from)?;
        Ok(conversation.clone())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| conversation.is_member(user_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MembershipDirectory for MemoryConversationRepository {
    async fn is_member(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(&conversation_id)
            .map(|conversation| conversation.is_member(user_id))
            .unwrap_or(false))
    }

    async fn members_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let conversations = self.conversations.read().await;
        conversations
            .get(&conversation_id)
            .map(|conversation| conversation.members.clone())
            .ok_or(RepositoryError::NotFound)
    }
}
