//! 消息实体定义

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryState;
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageContent, MessageId, Timestamp, UserId};

/// 软删除后留在原位的墓碑文本。
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

/// 发送后允许编辑的时间窗口（分钟）。
pub const EDIT_WINDOW_MINUTES: i64 = 15;

/// 消息正文，按内容类型区分。
///
/// 附件只携带 blob 存储返回的不透明引用，上传下载不在本核心内发生。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        text: MessageContent,
    },
    File {
        url: String,
        filename: String,
        size: u64,
    },
    Image {
        url: String,
        thumbnail: Option<String>,
    },
}

impl MessageBody {
    pub fn text(value: impl Into<String>) -> DomainResult<Self> {
        Ok(Self::Text {
            text: MessageContent::new(value)?,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text { .. } => "text",
            MessageBody::File { .. } => "file",
            MessageBody::Image { .. } => "image",
        }
    }

    fn tombstone() -> Self {
        Self::Text {
            text: MessageContent::tombstone_text(TOMBSTONE_TEXT),
        }
    }
}

/// 消息实体
///
/// `status` 是相对接收方的聚合视图：单聊即唯一接收者的投递记录，
/// 群聊取所有接收者记录的最小值。逐接收者的事实保存在投递记录里。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub reply_to: Option<MessageId>,
    pub status: DeliveryState,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: Timestamp,
    pub updated_at: Option<Timestamp>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        body: MessageBody,
        reply_to: Option<MessageId>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            body,
            reply_to,
            status: DeliveryState::Sent,
            is_edited: false,
            is_deleted: false,
            created_at,
            updated_at: None,
        }
    }

    /// 编辑消息正文。只有文本消息可编辑，墓碑消息和超出
    /// 编辑窗口的消息都会被拒绝。
    pub fn edit(&mut self, new_content: MessageContent, at: Timestamp) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::invalid_state("message is deleted"));
        }
        if !matches!(self.body, MessageBody::Text { .. }) {
            return Err(DomainError::invalid_state("only text messages can be edited"));
        }
        if at - self.created_at > Duration::minutes(EDIT_WINDOW_MINUTES) {
            return Err(DomainError::invalid_state("edit window elapsed"));
        }

        self.body = MessageBody::Text { text: new_content };
        self.is_edited = true;
        self.updated_at = Some(at);
        Ok(())
    }

    /// 软删除。正文替换为墓碑文本，id 和时间戳保留。
    pub fn soft_delete(&mut self, at: Timestamp) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::invalid_state("message is already deleted"));
        }

        self.body = MessageBody::tombstone();
        self.is_deleted = true;
        self.updated_at = Some(at);
        Ok(())
    }

    /// 墓碑消息不能再作为回复目标。
    pub fn can_be_replied_to(&self) -> bool {
        !self.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn text_message(created_at: Timestamp) -> Message {
        Message::new(
            MessageId::new(1),
            ConversationId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            MessageBody::text("hello").unwrap(),
            None,
            created_at,
        )
    }

    #[test]
    fn new_message_starts_as_sent() {
        let message = text_message(Utc::now());
        assert_eq!(message.status, DeliveryState::Sent);
        assert!(!message.is_edited);
        assert!(!message.is_deleted);
        assert!(message.can_be_replied_to());
    }

    #[test]
    fn edit_within_window() {
        let now = Utc::now();
        let mut message = text_message(now);

        message
            .edit(MessageContent::new("updated").unwrap(), now + Duration::minutes(5))
            .unwrap();

        assert!(message.is_edited);
        assert!(message.updated_at.is_some());
        match &message.body {
            MessageBody::Text { text } => assert_eq!(text.as_str(), "updated"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn edit_after_window_rejected() {
        let now = Utc::now();
        let mut message = text_message(now);

        let result = message.edit(
            MessageContent::new("too late").unwrap(),
            now + Duration::minutes(EDIT_WINDOW_MINUTES + 1),
        );
        assert!(matches!(result, Err(DomainError::InvalidState { .. })));
    }

    #[test]
    fn file_messages_are_not_editable() {
        let now = Utc::now();
        let mut message = text_message(now);
        message.body = MessageBody::File {
            url: "/api/files/abc".into(),
            filename: "report.pdf".into(),
            size: 2048,
        };

        assert!(message
            .edit(MessageContent::new("nope").unwrap(), now)
            .is_err());
    }

    #[test]
    fn soft_delete_leaves_tombstone() {
        let now = Utc::now();
        let mut message = text_message(now);

        message.soft_delete(now).unwrap();

        assert!(message.is_deleted);
        assert!(!message.can_be_replied_to());
        match &message.body {
            MessageBody::Text { text } => assert_eq!(text.as_str(), TOMBSTONE_TEXT),
            other => panic!("unexpected body {other:?}"),
        }

        // 删除后不能再编辑，墓碑内容保持不变
        let err = message.edit(MessageContent::new("resurrect").unwrap(), now);
        assert!(matches!(err, Err(DomainError::InvalidState { .. })));
        match &message.body {
            MessageBody::Text { text } => assert_eq!(text.as_str(), TOMBSTONE_TEXT),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn double_delete_rejected() {
        let now = Utc::now();
        let mut message = text_message(now);
        message.soft_delete(now).unwrap();
        assert!(matches!(
            message.soft_delete(now),
            Err(DomainError::InvalidState { .. })
        ));
    }

    #[test]
    fn body_serializes_with_kind_tag() {
        let body = MessageBody::text("hi").unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "text");

        let file = MessageBody::File {
            url: "/api/files/xyz".into(),
            filename: "photo.png".into(),
            size: 1,
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["kind"], "file");
        assert_eq!(json["filename"], "photo.png");
    }
}
