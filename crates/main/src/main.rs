//! 主应用程序入口
//!
//! 组装存储、注册表、会话门和投递引擎，启动 Axum 服务。

use std::{sync::Arc, time::Duration};

use application::{
    ChatService, ChatServiceDependencies, Clock, ConnectionRegistry, PresenceTracker,
    PresenceTransition, SessionGate, SystemClock,
};
use infrastructure::{create_pg_pool, JwtAuthority, PgConversationRepository, PgMessageRepository};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = config::AppConfig::from_env_with_defaults();

    tracing::info!(
        "连接数据库: {}",
        app_config.database.url.split('@').next_back().unwrap_or("unknown")
    );

    let pg_pool = create_pg_pool(&app_config.database.url).await?;

    // 运行迁移
    sqlx::migrate!("../../migrations").run(&pg_pool).await?;

    let message_repository = Arc::new(PgMessageRepository::new(pg_pool.clone()));
    let conversation_repository = Arc::new(PgConversationRepository::new(pg_pool));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let presence = Arc::new(PresenceTracker::new(clock.clone()));
    let registry = Arc::new(ConnectionRegistry::new(presence.clone()));

    // 在线跳变写进日志，只在占用 0 与非 0 之间切换时出现
    let mut transitions = presence.subscribe();
    tokio::spawn(async move {
        while let Ok(transition) = transitions.recv().await {
            match transition {
                PresenceTransition::Online { user_id } => {
                    tracing::info!(user_id = %user_id, "用户上线");
                }
                PresenceTransition::Offline { user_id, last_seen } => {
                    tracing::info!(user_id = %user_id, last_seen = %last_seen, "用户下线");
                }
            }
        }
    });
    let verifier = Arc::new(JwtAuthority::new(&app_config.jwt));

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        message_repository,
        membership: conversation_repository.clone(),
        registry: registry.clone(),
        presence: presence.clone(),
        clock,
        push_timeout: Duration::from_millis(app_config.delivery.push_timeout_ms),
    }));

    let gate = Arc::new(SessionGate::new(
        verifier.clone(),
        conversation_repository.clone(),
        registry.clone(),
    ));

    let state = AppState::new(
        chat_service,
        gate,
        registry,
        presence,
        conversation_repository,
        verifier,
        app_config.delivery.clone(),
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind((
        app_config.server.host.as_str(),
        app_config.server.port,
    ))
    .await?;

    tracing::info!(
        "即时通讯服务器启动在 http://{}:{}",
        app_config.server.host,
        app_config.server.port
    );
    axum::serve(listener, app).await?;

    Ok(())
}
