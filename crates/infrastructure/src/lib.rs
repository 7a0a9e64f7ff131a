//! 基础设施层
//!
//! PostgreSQL 存储实现和 JWT 身份校验。内存实现位于
//! `application::memory`，供测试和单机部署使用。

pub mod auth;
pub mod db;

pub use auth::{Claims, JwtAuthority};
pub use db::{create_pg_pool, DbPool, PgConversationRepository, PgMessageRepository};
