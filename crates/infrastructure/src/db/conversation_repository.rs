//! 会话目录的 PostgreSQL 实现
//!
//! 单聊唯一性靠归一化的成员对键上的唯一约束保证。

use application::{ConversationRepository, MembershipDirectory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    normalize_pair, Conversation, ConversationId, ConversationKind, RepositoryError, UserId,
};
use sqlx::FromRow;
use uuid::Uuid;

use super::DbPool;

#[derive(Debug, FromRow)]
struct DbConversation {
    id: Uuid,
    kind: String,
    name: Option<String>,
    creator_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

fn storage(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn direct_key(a: UserId, b: UserId) -> String {
    let (left, right) = normalize_pair(a, b);
    format!("{left}:{right}")
}

fn parse_kind(kind: &str) -> Result<ConversationKind, RepositoryError> {
    match kind {
        "direct" => Ok(ConversationKind::Direct),
        "room" => Ok(ConversationKind::Room),
        other => Err(RepositoryError::storage(format!(
            "unknown conversation kind {other}"
        ))),
    }
}

fn kind_str(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "direct",
        ConversationKind::Room => "room",
    }
}

pub struct PgConversationRepository {
    pool: DbPool,
}

impl PgConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load(&self, row: DbConversation) -> Result<Conversation, RepositoryError> {
        let members: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_members WHERE conversation_id = $1 \
             ORDER BY joined_at",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(Conversation {
            id: ConversationId::from(row.id),
            kind: parse_kind(&row.kind)?,
            members: members.into_iter().map(UserId::from).collect(),
            creator: row.creator_id.map(UserId::from),
            name: row.name,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let direct_key = conversation
            .direct_pair()
            .map(|(a, b)| direct_key(a, b));

        let inserted = sqlx::query(
            "INSERT INTO conversations (id, kind, name, creator_id, direct_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT DO NOTHING",
        )
        .bind(Uuid::from(conversation.id))
        .bind(kind_str(conversation.kind))
        .bind(conversation.name.clone())
        .bind(conversation.creator.map(Uuid::from))
        .bind(direct_key)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if inserted.rows_affected() == 0 {
            return Err(RepositoryError::Conflict);
        }

        for member in &conversation.members {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, joined_at) \
                 VALUES ($1, $2, $3)",
            )
            .bind(Uuid::from(conversation.id))
            .bind(Uuid::from(*member))
            .bind(conversation.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row: Option<DbConversation> = sqlx::query_as(
            "SELECT id, kind, name, creator_id, created_at FROM conversations WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_direct(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row: Option<DbConversation> = sqlx::query_as(
            "SELECT id, kind, name, creator_id, created_at FROM conversations \
             WHERE direct_key = $1",
        )
        .bind(direct_key(a, b))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn add_member(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError> {
        let kind: Option<String> =
            sqlx::query_scalar("SELECT kind FROM conversations WHERE id = $1")
                .bind(Uuid::from(id))
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        let kind = kind.ok_or(RepositoryError::NotFound)?;
        if parse_kind(&kind)? != ConversationKind::Room {
            return Err(RepositoryError::invalid_state(
                "direct conversations have a fixed member pair",
            ));
        }

        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, joined_at) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        self.find_by_id(id).await?.ok_or(RepositoryError::NotFound)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError> {
        let rows: Vec<DbConversation> = sqlx::query_as(
            "SELECT c.id, c.kind, c.name, c.creator_id, c.created_at \
             FROM conversations c \
             JOIN conversation_members m ON m.conversation_id = c.id \
             WHERE m.user_id = $1 \
             ORDER BY c.created_at DESC",
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            conversations.push(self.load(row).await?);
        }
        Ok(conversations)
    }
}

#[async_trait]
impl MembershipDirectory for PgConversationRepository {
    async fn is_member(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, RepositoryError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM conversation_members \
             WHERE conversation_id = $1 AND user_id = $2)",
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(exists)
    }

    async fn members_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM conversations WHERE id = $1)")
                .bind(Uuid::from(conversation_id))
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        if !exists {
            return Err(RepositoryError::NotFound);
        }

        let members: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_members WHERE conversation_id = $1",
        )
        .bind(Uuid::from(conversation_id))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(members.into_iter().map(UserId::from).collect())
    }
}
