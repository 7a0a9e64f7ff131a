use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::ApplicationError;
use domain::{
    Conversation, ConversationId, ConversationKind, Message, MessageContent, MessageId,
    PresenceSnapshot, RepositoryError, Timestamp, UserId,
};

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::websocket_upgrade;

#[derive(Debug, Deserialize)]
struct CreateRoomPayload {
    name: String,
    #[serde(default)]
    member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct AddMemberPayload {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct EditMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<i64>,
    limit: Option<u32>,
}

/// 会话列表项，单聊附带对端的在线状态
#[derive(Debug, Serialize)]
struct ConversationSummary {
    id: ConversationId,
    kind: ConversationKind,
    name: Option<String>,
    members: Vec<UserId>,
    created_at: Timestamp,
    peer: Option<PresenceSnapshot>,
}

fn repo_err(err: RepositoryError) -> ApiError {
    ApiError::from(ApplicationError::from(err))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/conversations", get(list_conversations))
        .route("/conversations/with/{user_id}", post(get_or_create_direct))
        .route(
            "/conversations/{conversation_id}/messages",
            get(get_history),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            put(edit_message).delete(delete_message),
        )
        .route("/rooms", post(create_room))
        .route("/rooms/{conversation_id}/members", post(add_room_member))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;

    let conversations = state
        .conversations
        .list_for_user(user_id)
        .await
        .map_err(repo_err)?;

    let summaries = conversations
        .into_iter()
        .map(|conversation| {
            let peer = match conversation.kind {
                ConversationKind::Direct => conversation
                    .members
                    .iter()
                    .find(|member| **member != user_id)
                    .map(|member| state.presence.snapshot(*member)),
                ConversationKind::Room => None,
            };
            ConversationSummary {
                id: conversation.id,
                kind: conversation.kind,
                name: conversation.name,
                members: conversation.members,
                created_at: conversation.created_at,
                peer,
            }
        })
        .collect();

    Ok(Json(summaries))
}

async fn get_or_create_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let me = authenticate(&state, &headers).await?;
    let other = UserId::from(user_id);

    if let Some(existing) = state
        .conversations
        .find_direct(me, other)
        .await
        .map_err(repo_err)?
    {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let conversation = Conversation::new_direct(
        ConversationId::from(Uuid::new_v4()),
        me,
        other,
        Utc::now(),
    )
    .map_err(|err| ApiError::from(ApplicationError::Domain(err)))?;

    match state.conversations.create(conversation).await {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        // 并发创建输掉竞争：另一个请求先建好了，取它
        Err(RepositoryError::Conflict) => {
            let existing = state
                .conversations
                .find_direct(me, other)
                .await
                .map_err(repo_err)?
                .ok_or_else(|| ApiError::internal_server_error("conversation vanished"))?;
            Ok((StatusCode::OK, Json(existing)))
        }
        Err(err) => Err(repo_err(err)),
    }
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRoomPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let me = authenticate(&state, &headers).await?;

    let conversation = Conversation::new_room(
        ConversationId::from(Uuid::new_v4()),
        payload.name,
        me,
        payload.member_ids.into_iter().map(UserId::from).collect(),
        Utc::now(),
    )
    .map_err(|err| ApiError::from(ApplicationError::Domain(err)))?;

    let created = state
        .conversations
        .create(conversation)
        .await
        .map_err(repo_err)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn add_room_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<AddMemberPayload>,
) -> Result<Json<Conversation>, ApiError> {
    let me = authenticate(&state, &headers).await?;
    let conversation_id = ConversationId::from(conversation_id);

    let conversation = state
        .conversations
        .find_by_id(conversation_id)
        .await
        .map_err(repo_err)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;

    // 只有群聊创建者可以加成员
    if conversation.creator != Some(me) {
        return Err(ApiError::forbidden("only the room creator may add members"));
    }

    let updated = state
        .conversations
        .add_member(conversation_id, UserId::from(payload.user_id))
        .await
        .map_err(repo_err)?;
    Ok(Json(updated))
}

/// 拉取历史消息页。副作用：该用户所有 sent 投递记录被对账为 delivered。
async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;

    let page = state
        .chat_service
        .fetch_history(
            user_id,
            ConversationId::from(conversation_id),
            query.before.map(MessageId::new),
            query.limit.unwrap_or(50),
        )
        .await?;
    Ok(Json(page))
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, message_id)): Path<(Uuid, i64)>,
    Json(payload): Json<EditMessagePayload>,
) -> Result<Json<Message>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;

    let content = MessageContent::new(payload.content)
        .map_err(|err| ApiError::from(ApplicationError::Domain(err)))?;

    let updated = state
        .chat_service
        .edit_message(
            user_id,
            ConversationId::from(conversation_id),
            MessageId::new(message_id),
            content,
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, message_id)): Path<(Uuid, i64)>,
) -> Result<StatusCode, ApiError> {
    let user_id = authenticate(&state, &headers).await?;

    state
        .chat_service
        .delete_message(
            user_id,
            ConversationId::from(conversation_id),
            MessageId::new(message_id),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
