//! 推送到客户端连接的实时事件
//!
//! 事件是传输层负载，序列化后写入 WebSocket。typing 和 user_status
//! 是瞬态广播，没有存储状态也没有投递保证。

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryState;
use crate::message::Message;
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// 新消息送达本连接。
    Message { message: Message },

    /// 某条消息对某接收者的投递状态发生变化。
    StatusUpdate {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryState,
    },

    /// 正在输入指示，尽力而为，不重试。
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    /// 会话内成员上线或下线。
    UserStatus {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<Timestamp>,
    },

    MessageEdited { message: Message },

    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ChatEvent::Typing {
            conversation_id: ConversationId::from(Uuid::new_v4()),
            user_id: UserId::from(Uuid::new_v4()),
            is_typing: true,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["is_typing"], true);
    }

    #[test]
    fn status_update_round_trip() {
        let event = ChatEvent::StatusUpdate {
            conversation_id: ConversationId::from(Uuid::new_v4()),
            message_id: MessageId::new(3),
            user_id: UserId::from(Uuid::new_v4()),
            status: DeliveryState::Read,
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: ChatEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
