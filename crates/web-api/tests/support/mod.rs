use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{
    ChatService, ChatServiceDependencies, ConnectionRegistry, ConversationRepository,
    MemoryConversationRepository, MemoryMessageRepository, PresenceTracker, SessionGate,
    SystemClock,
};
use chrono::Utc;
use config::{DeliveryConfig, JwtConfig};
use domain::{Conversation, ConversationId, UserId};
use infrastructure::JwtAuthority;
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use uuid::Uuid;
use web_api::{router, AppState};

/// 跑在随机端口上的测试服务，内存存储加真实 JWT 校验。
pub struct TestApp {
    pub addr: SocketAddr,
    pub authority: Arc<JwtAuthority>,
    pub conversations: Arc<MemoryConversationRepository>,
    _shutdown: oneshot::Sender<()>,
}

impl TestApp {
    pub fn http(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, conversation_id: ConversationId, token: &str) -> String {
        format!(
            "ws://{}/api/v1/ws?conversation_id={}&token={}",
            self.addr, conversation_id, token
        )
    }

    pub fn token_for(&self, user_id: UserId) -> String {
        self.authority.issue(user_id).expect("issue token")
    }

    pub async fn direct_conversation(&self, a: UserId, b: UserId) -> ConversationId {
        let conversation = Conversation::new_direct(
            ConversationId::from(Uuid::new_v4()),
            a,
            b,
            Utc::now(),
        )
        .expect("direct conversation");
        let id = conversation.id;
        self.conversations
            .create(conversation)
            .await
            .expect("create conversation");
        id
    }

    pub async fn room_conversation(
        &self,
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
        .expect("room conversation");
        let id = conversation.id;
        self.conversations
            .create(conversation)
            .await
            .expect("create room");
        id
    }
}

pub async fn spawn_app() -> TestApp {
    let clock = Arc::new(SystemClock);
    let presence = Arc::new(PresenceTracker::new(clock.clone()));
    let registry = Arc::new(ConnectionRegistry::new(presence.clone()));
    let messages = Arc::new(MemoryMessageRepository::new());
    let conversations = Arc::new(MemoryConversationRepository::new());
    let authority = Arc::new(JwtAuthority::new(&JwtConfig {
        secret: "test-secret-key".to_string(),
        expiration_hours: 24,
    }));

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        message_repository: messages,
        membership: conversations.clone(),
        registry: registry.clone(),
        presence: presence.clone(),
        clock,
        push_timeout: Duration::from_millis(500),
    }));

    let gate = Arc::new(SessionGate::new(
        authority.clone(),
        conversations.clone(),
        registry.clone(),
    ));

    let state = AppState::new(
        chat_service,
        gate,
        registry,
        presence,
        conversations.clone(),
        authority.clone(),
        DeliveryConfig {
            push_timeout_ms: 500,
            outbound_capacity: 64,
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // allow server to start
    sleep(Duration::from_millis(100)).await;

    TestApp {
        addr,
        authority,
        conversations,
        _shutdown: shutdown_tx,
    }
}
