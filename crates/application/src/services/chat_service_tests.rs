//! 投递扇出引擎单元测试
//!
//! 覆盖离线补投、多设备扇出、无自投递、非成员拒绝、墓碑语义
//! 和慢连接拆除。

#[cfg(test)]
mod chat_service_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use domain::{
        ChatEvent, Conversation, ConversationId, DeliveryState, DomainError, MessageBody,
        MessageContent, TOMBSTONE_TEXT, UserId,
    };
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::clock::SystemClock;
    use crate::error::ApplicationError;
    use crate::memory::{MemoryConversationRepository, MemoryMessageRepository};
    use crate::presence::PresenceTracker;
    use crate::registry::{ConnectionRegistry, ConnectionToken};
    use crate::repository::MessageRepository;
    use crate::repository::ConversationRepository;
    use crate::services::chat_service::{
        ChatService, ChatServiceDependencies, SendMessageRequest,
    };

    struct Fixture {
        service: ChatService,
        registry: Arc<ConnectionRegistry>,
        messages: Arc<MemoryMessageRepository>,
        conversations: Arc<MemoryConversationRepository>,
    }

    fn fixture() -> Fixture {
        let presence = Arc::new(PresenceTracker::new(Arc::new(SystemClock)));
        let registry = Arc::new(ConnectionRegistry::new(presence.clone()));
        let messages = Arc::new(MemoryMessageRepository::new());
        let conversations = Arc::new(MemoryConversationRepository::new());

        let service = ChatService::new(ChatServiceDependencies {
            message_repository: messages.clone(),
            membership: conversations.clone(),
            registry: registry.clone(),
            presence,
            clock: Arc::new(SystemClock),
            push_timeout: Duration::from_millis(200),
        });

        Fixture {
            service,
            registry,
            messages,
            conversations,
        }
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    async fn direct(fixture: &Fixture, a: UserId, b: UserId) -> ConversationId {
        let conversation = Conversation::new_direct(
            ConversationId::from(Uuid::new_v4()),
            a,
            b,
            Utc::now(),
        )
        .unwrap();
        let id = conversation.id;
        fixture.conversations.create(conversation).await.unwrap();
        id
    }

    async fn room(
        fixture: &Fixture,
        creator: UserId,
        members: Vec<UserId>,
    ) -> ConversationId {
        let conversation = Conversation::new_room(
            ConversationId::from(Uuid::new_v4()),
            "room",
            creator,
            members,
            Utc::now(),
        )
        .unwrap();
        let id = conversation.id;
        fixture.conversations.create(conversation).await.unwrap();
        id
    }

    async fn connect(
        fixture: &Fixture,
        user_id: UserId,
        scope: ConversationId,
    ) -> (ConnectionToken, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let token = fixture.registry.register(user_id, scope, tx).await;
        (token, rx)
    }

    fn text_request(
        conversation_id: ConversationId,
        sender_id: UserId,
        text: &str,
    ) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id,
            sender_id,
            body: MessageBody::text(text).unwrap(),
            reply_to: None,
        }
    }

    /// 场景：接收者离线，消息保持 sent；拉取历史后变 delivered；
    /// 显式确认 read；之后回退到 delivered 被拒绝。
    #[tokio::test]
    async fn offline_recipient_reconciles_through_history_fetch() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "hi"))
            .await
            .unwrap();
        assert_eq!(message.status, DeliveryState::Sent);

        // Bob 打开会话拉取历史，sent 被对账为 delivered
        let history = fixture
            .service
            .fetch_history(bob, conversation, None, 50)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeliveryState::Delivered);

        fixture
            .service
            .update_status(bob, conversation, message.id, DeliveryState::Read)
            .await
            .unwrap();

        let regression = fixture
            .service
            .update_status(bob, conversation, message.id, DeliveryState::Delivered)
            .await;
        assert!(matches!(
            regression,
            Err(ApplicationError::Domain(DomainError::InvalidState { .. }))
        ));

        let stored = fixture
            .messages
            .find(conversation, message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeliveryState::Read);
    }

    /// 场景：Bob 开着两个连接，每个连接恰好收到一次推送；
    /// Alice 自己的连接收到零次（没有自投递）；状态立即 delivered。
    #[tokio::test]
    async fn multi_device_fan_out_without_self_delivery() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let (_token_a, mut alice_rx) = connect(&fixture, alice, conversation).await;
        let (_token_b1, mut bob_rx1) = connect(&fixture, bob, conversation).await;
        let (_token_b2, mut bob_rx2) = connect(&fixture, bob, conversation).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "hello"))
            .await
            .unwrap();
        assert_eq!(message.status, DeliveryState::Delivered);

        for rx in [&mut bob_rx1, &mut bob_rx2] {
            match rx.try_recv().unwrap() {
                ChatEvent::Message { message: pushed } => {
                    assert_eq!(pushed.id, message.id);
                    assert_eq!(pushed.status, DeliveryState::Delivered);
                }
                other => panic!("unexpected event {other:?}"),
            }
            // 恰好一次
            assert!(rx.try_recv().is_err());
        }

        assert!(alice_rx.try_recv().is_err());
    }

    /// 场景：群聊成员一个离线、一个连接在别的会话上，
    /// 两者都没有在作用域内的连接，状态保持 sent。
    #[tokio::test]
    async fn out_of_scope_connections_do_not_count_as_delivery() {
        let fixture = fixture();
        let (a, b, c) = (user(), user(), user());
        let room_id = room(&fixture, a, vec![b, c]).await;
        let elsewhere = direct(&fixture, b, c).await;

        // C 在线，但绑定在另一个会话上
        let (_token, mut c_rx) = connect(&fixture, c, elsewhere).await;

        let message = fixture
            .service
            .submit(text_request(room_id, a, "meeting at 5"))
            .await
            .unwrap();
        assert_eq!(message.status, DeliveryState::Sent);
        assert!(c_rx.try_recv().is_err());

        let records = fixture
            .messages
            .delivery_records(room_id, message.id)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.state == DeliveryState::Sent));
    }

    /// 场景：非成员提交被拒绝，存储里没有新行。
    #[tokio::test]
    async fn non_member_submission_leaves_store_untouched() {
        let fixture = fixture();
        let (alice, bob, outsider) = (user(), user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let result = fixture
            .service
            .submit(text_request(conversation, outsider, "let me in"))
            .await;
        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::NotAuthorized))
        ));

        let stored = fixture
            .messages
            .list_before(conversation, None, 50)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    /// 场景：软删除后编辑被拒绝，墓碑内容保持不变。
    #[tokio::test]
    async fn editing_deleted_message_is_rejected() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "original"))
            .await
            .unwrap();

        let deleted = fixture
            .service
            .delete_message(alice, conversation, message.id)
            .await
            .unwrap();
        assert!(deleted.is_deleted);

        let result = fixture
            .service
            .edit_message(
                alice,
                conversation,
                message.id,
                MessageContent::new("edited").unwrap(),
            )
            .await;
        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::InvalidState { .. }))
        ));

        let stored = fixture
            .messages
            .find(conversation, message.id)
            .await
            .unwrap()
            .unwrap();
        match &stored.body {
            MessageBody::Text { text } => assert_eq!(text.as_str(), TOMBSTONE_TEXT),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_sender_may_edit_or_delete() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "mine"))
            .await
            .unwrap();

        let edit = fixture
            .service
            .edit_message(
                bob,
                conversation,
                message.id,
                MessageContent::new("hijack").unwrap(),
            )
            .await;
        assert!(matches!(
            edit,
            Err(ApplicationError::Domain(DomainError::NotAuthorized))
        ));

        let delete = fixture
            .service
            .delete_message(bob, conversation, message.id)
            .await;
        assert!(matches!(
            delete,
            Err(ApplicationError::Domain(DomainError::NotAuthorized))
        ));
    }

    #[tokio::test]
    async fn reply_to_deleted_message_is_rejected() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "root"))
            .await
            .unwrap();
        fixture
            .service
            .delete_message(alice, conversation, message.id)
            .await
            .unwrap();

        let mut reply = text_request(conversation, bob, "re: root");
        reply.reply_to = Some(message.id);
        let result = fixture.service.submit(reply).await;
        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::InvalidState { .. }))
        ));
    }

    /// 正在输入指示推给会话内其他人，发送者自己收不到。
    #[tokio::test]
    async fn typing_indicator_reaches_other_scoped_connections() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let (_ta, mut alice_rx) = connect(&fixture, alice, conversation).await;
        let (_tb, mut bob_rx) = connect(&fixture, bob, conversation).await;

        fixture
            .service
            .notify_typing(alice, conversation, true)
            .await;

        match bob_rx.try_recv().unwrap() {
            ChatEvent::Typing {
                user_id, is_typing, ..
            } => {
                assert_eq!(user_id, alice);
                assert!(is_typing);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    /// 状态确认会通知会话内其他成员的活跃连接。
    #[tokio::test]
    async fn read_receipt_is_pushed_to_the_sender() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "seen?"))
            .await
            .unwrap();

        let (_ta, mut alice_rx) = connect(&fixture, alice, conversation).await;
        fixture
            .service
            .update_status(bob, conversation, message.id, DeliveryState::Read)
            .await
            .unwrap();

        match alice_rx.try_recv().unwrap() {
            ChatEvent::StatusUpdate {
                message_id,
                user_id,
                status,
                ..
            } => {
                assert_eq!(message_id, message.id);
                assert_eq!(user_id, bob);
                assert_eq!(status, DeliveryState::Read);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_member_cannot_update_status_or_fetch_history() {
        let fixture = fixture();
        let (alice, bob, outsider) = (user(), user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "private"))
            .await
            .unwrap();

        let status = fixture
            .service
            .update_status(outsider, conversation, message.id, DeliveryState::Read)
            .await;
        assert!(matches!(
            status,
            Err(ApplicationError::Domain(DomainError::NotAuthorized))
        ));

        let history = fixture
            .service
            .fetch_history(outsider, conversation, None, 10)
            .await;
        assert!(matches!(
            history,
            Err(ApplicationError::Domain(DomainError::NotAuthorized))
        ));
    }

    /// 阻塞的慢连接在推送超时后被拆除，消息本身不受影响。
    #[tokio::test]
    async fn stalled_connection_is_torn_down_on_push_timeout() {
        let fixture = fixture();
        let (alice, bob) = (user(), user());
        let conversation = direct(&fixture, alice, bob).await;

        // 容量 1 且无人消费：第一条占满队列，第二条触发超时
        let (tx, _stalled_rx) = mpsc::channel(1);
        tx.try_send(ChatEvent::Typing {
            conversation_id: conversation,
            user_id: bob,
            is_typing: false,
        })
        .unwrap();
        fixture.registry.register(bob, conversation, tx).await;

        let message = fixture
            .service
            .submit(text_request(conversation, alice, "are you there"))
            .await
            .unwrap();

        // 追加已经成功，连接被注销
        assert!(fixture
            .messages
            .find(conversation, message.id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(fixture.registry.occupancy(bob).await, 0);
    }
}
