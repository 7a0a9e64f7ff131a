//! PostgreSQL 连接池和存储实现

mod conversation_repository;
mod message_repository;

pub use conversation_repository::PgConversationRepository;
pub use message_repository::PgMessageRepository;

use sqlx::postgres::PgPoolOptions;

pub type DbPool = sqlx::PgPool;

pub async fn create_pg_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}
