//! 即时通讯系统核心领域模型
//!
//! 包含用户、会话、消息、投递记录等核心实体，以及相关的业务规则。

pub mod conversation;
pub mod delivery;
pub mod errors;
pub mod events;
pub mod message;
pub mod user;
pub mod value_objects;

pub use conversation::*;
pub use delivery::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use user::*;
pub use value_objects::*;
