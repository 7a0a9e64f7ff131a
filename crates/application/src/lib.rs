//! 实时投递核心
//!
//! 连接注册表、在线追踪、消息存储接口与投递扇出引擎。
//! 身份校验和成员关系由外部协作方提供，本层只定义接口。

pub mod auth;
pub mod clock;
pub mod error;
pub mod gate;
pub mod membership;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod repository;
pub mod services;

pub use auth::{IdentityError, IdentityVerifier};
pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use gate::{AdmittedConnection, SessionGate};
pub use membership::MembershipDirectory;
pub use memory::{MemoryConversationRepository, MemoryMessageRepository};
pub use presence::{PresenceTracker, PresenceTransition};
pub use registry::{ConnectionRegistry, ConnectionToken, LiveConnection};
pub use repository::{ConversationRepository, MessageRepository, NewMessage};
pub use services::{ChatService, ChatServiceDependencies, SendMessageRequest};
