//! 消息存储的 PostgreSQL 实现
//!
//! 会话内的 id 分配靠会话行锁串行化：追加事务先锁住
//! conversations 里对应的行，再取 MAX(id)+1，保证同一会话内
//! 严格递增无空洞，不同会话互不阻塞。

use std::collections::HashMap;

use application::{MessageRepository, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ConversationId, DeliveryRecord, DeliveryState, Message, MessageBody, MessageContent,
    MessageId, RepositoryError, Timestamp, UserId,
};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use super::DbPool;

/// 数据库消息行
#[derive(Debug, FromRow)]
struct DbMessage {
    conversation_id: Uuid,
    id: i64,
    sender_id: Uuid,
    body: String,
    reply_to: Option<i64>,
    status: String,
    is_edited: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl DbMessage {
    fn into_message(self) -> Result<Message, RepositoryError> {
        let body: MessageBody = serde_json::from_str(&self.body)
            .map_err(|err| RepositoryError::storage(format!("corrupt message body: {err}")))?;
        let status = DeliveryState::parse(&self.status)
            .ok_or_else(|| RepositoryError::storage(format!("unknown status {}", self.status)))?;

        Ok(Message {
            id: MessageId::new(self.id),
            conversation_id: ConversationId::from(self.conversation_id),
            sender_id: UserId::from(self.sender_id),
            body,
            reply_to: self.reply_to.map(MessageId::new),
            status,
            is_edited: self.is_edited,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn storage(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn encode_body(body: &MessageBody) -> Result<String, RepositoryError> {
    serde_json::to_string(body)
        .map_err(|err| RepositoryError::storage(format!("body serialization failed: {err}")))
}

pub struct PgMessageRepository {
    pool: DbPool,
}

impl PgMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// 聚合状态取所有接收者记录的最小值，在当前事务内重算。
    async fn recompute_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        message_id: i64,
    ) -> Result<(), RepositoryError> {
        let statuses: Vec<String> = sqlx::query_scalar(
            "SELECT status FROM message_deliveries WHERE conversation_id = $1 AND message_id = $2",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage)?;

        let aggregate = statuses
            .iter()
            .filter_map(|status| DeliveryState::parse(status))
            .min();

        if let Some(state) = aggregate {
            sqlx::query("UPDATE messages SET status = $3 WHERE conversation_id = $1 AND id = $2")
                .bind(conversation_id)
                .bind(message_id)
                .bind(state.as_str())
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    /// 锁住消息行并反序列化，编辑和删除共用。
    async fn lock_message(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        message_id: i64,
    ) -> Result<Message, RepositoryError> {
        let row: Option<DbMessage> = sqlx::query_as(
            "SELECT conversation_id, id, sender_id, body, reply_to, status, is_edited, is_deleted, \
             created_at, updated_at \
             FROM messages WHERE conversation_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?;

        row.ok_or(RepositoryError::NotFound)?.into_message()
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(&self, new_message: NewMessage) -> Result<Message, RepositoryError> {
        let conversation_id: Uuid = new_message.conversation_id.into();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // 会话行锁，id 分配在会话内串行化
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
        if locked.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let next_id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let message = Message::new(
            MessageId::new(next_id),
            new_message.conversation_id,
            new_message.sender_id,
            new_message.body,
            new_message.reply_to,
            new_message.created_at,
        );

        sqlx::query(
            "INSERT INTO messages \
             (conversation_id, id, sender_id, body, reply_to, status, is_edited, is_deleted, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, FALSE, $7)",
        )
        .bind(conversation_id)
        .bind(next_id)
        .bind(Uuid::from(message.sender_id))
        .bind(encode_body(&message.body)?)
        .bind(message.reply_to.map(|id| id.value()))
        .bind(message.status.as_str())
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for recipient in &new_message.recipients {
            sqlx::query(
                "INSERT INTO message_deliveries \
                 (conversation_id, message_id, user_id, status, updated_at) \
                 VALUES ($1, $2, $3, 'sent', $4)",
            )
            .bind(conversation_id)
            .bind(next_id)
            .bind(Uuid::from(*recipient))
            .bind(new_message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(message)
    }

    async fn find(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<Message>, RepositoryError> {
        let row: Option<DbMessage> = sqlx::query_as(
            "SELECT conversation_id, id, sender_id, body, reply_to, status, is_edited, is_deleted, \
             created_at, updated_at \
             FROM messages WHERE conversation_id = $1 AND id = $2",
        )
        .bind(Uuid::from(conversation_id))
        .bind(message_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(DbMessage::into_message).transpose()
    }

    async fn list_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows: Vec<DbMessage> = sqlx::query_as(
            "SELECT conversation_id, id, sender_id, body, reply_to, status, is_edited, is_deleted, \
             created_at, updated_at \
             FROM messages \
             WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR id < $2) \
             ORDER BY id DESC LIMIT $3",
        )
        .bind(Uuid::from(conversation_id))
        .bind(before.map(|id| id.value()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(DbMessage::into_message).collect()
    }

    async fn update_status(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        recipient: UserId,
        state: DeliveryState,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let conversation_id: Uuid = conversation_id.into();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM message_deliveries \
             WHERE conversation_id = $1 AND message_id = $2 AND user_id = $3 FOR UPDATE",
        )
        .bind(conversation_id)
        .bind(message_id.value())
        .bind(Uuid::from(recipient))
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let current = current.ok_or(RepositoryError::NotFound)?;
        let current = DeliveryState::parse(&current)
            .ok_or_else(|| RepositoryError::storage(format!("unknown status {current}")))?;

        // 状态机校验复用领域实体
        let mut record = DeliveryRecord {
            message_id,
            user_id: recipient,
            state: current,
            updated_at: at,
        };
        let changed = record.advance(state, at).map_err(RepositoryError::from)?;
        if !changed {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE message_deliveries SET status = $4, updated_at = $5 \
             WHERE conversation_id = $1 AND message_id = $2 AND user_id = $3",
        )
        .bind(conversation_id)
        .bind(message_id.value())
        .bind(Uuid::from(recipient))
        .bind(state.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        Self::recompute_aggregate(&mut tx, conversation_id, message_id.value()).await?;
        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn mark_all_delivered(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let conversation_id: Uuid = conversation_id.into();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let touched: Vec<i64> = sqlx::query_scalar(
            "UPDATE message_deliveries SET status = 'delivered', updated_at = $3 \
             WHERE conversation_id = $1 AND user_id = $2 AND status = 'sent' \
             RETURNING message_id",
        )
        .bind(conversation_id)
        .bind(Uuid::from(recipient))
        .bind(at)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        for message_id in &touched {
            Self::recompute_aggregate(&mut tx, conversation_id, *message_id).await?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(touched.len() as u64)
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        new_content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let conversation_id: Uuid = conversation_id.into();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let mut message = Self::lock_message(&mut tx, conversation_id, message_id.value()).await?;
        message
            .edit(new_content, at)
            .map_err(RepositoryError::from)?;

        sqlx::query(
            "UPDATE messages SET body = $3, is_edited = TRUE, updated_at = $4 \
             WHERE conversation_id = $1 AND id = $2",
        )
        .bind(conversation_id)
        .bind(message_id.value())
        .bind(encode_body(&message.body)?)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(message)
    }

    async fn soft_delete(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let conversation_id: Uuid = conversation_id.into();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let mut message = Self::lock_message(&mut tx, conversation_id, message_id.value()).await?;
        message.soft_delete(at).map_err(RepositoryError::from)?;

        sqlx::query(
            "UPDATE messages SET body = $3, is_deleted = TRUE, updated_at = $4 \
             WHERE conversation_id = $1 AND id = $2",
        )
        .bind(conversation_id)
        .bind(message_id.value())
        .bind(encode_body(&message.body)?)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(message)
    }

    async fn delivery_records(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let rows: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT user_id, status, updated_at FROM message_deliveries \
             WHERE conversation_id = $1 AND message_id = $2",
        )
        .bind(Uuid::from(conversation_id))
        .bind(message_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|(user_id, status, updated_at)| {
                let state = DeliveryState::parse(&status)
                    .ok_or_else(|| RepositoryError::storage(format!("unknown status {status}")))?;
                Ok(DeliveryRecord {
                    message_id,
                    user_id: UserId::from(user_id),
                    state,
                    updated_at,
                })
            })
            .collect()
    }

    async fn recipient_states(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, DeliveryState>, RepositoryError> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<i64> = message_ids.iter().map(|id| id.value()).collect();

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT message_id, status FROM message_deliveries \
             WHERE conversation_id = $1 AND user_id = $2 AND message_id = ANY($3)",
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(recipient))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|(message_id, status)| {
                let state = DeliveryState::parse(&status)
                    .ok_or_else(|| RepositoryError::storage(format!("unknown status {status}")))?;
                Ok((MessageId::new(message_id), state))
            })
            .collect()
    }
}
