//! WebSocket 处理器
//!
//! 升级前先过会话门：凭证无效或不是目标会话成员的连接在
//! 握手阶段就被拒绝，不会留下任何注册。

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use domain::{ConversationId, DeliveryState, MessageBody};

use crate::error::ApiError;
use crate::state::AppState;
use crate::ws_connection::WsConnection;

/// WebSocket连接查询参数
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// 连接绑定的会话作用域
    pub conversation_id: Uuid,
    /// 凭证 token
    pub token: String,
}

/// 客户端发来的帧
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 提交消息
    Send {
        body: MessageBody,
        reply_to: Option<i64>,
    },
    /// 确认投递状态（delivered 或 read）
    StatusUpdate {
        message_id: i64,
        status: DeliveryState,
    },
    /// 正在输入指示
    Typing { is_typing: bool },
}

/// 处理WebSocket连接升级
pub async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Result<Response, ApiError> {
    let scope = ConversationId::from(query.conversation_id);
    let (outbound_tx, outbound_rx) = mpsc::channel(state.delivery.outbound_capacity);

    // 准入失败在这里返回 401/403，握手直接失败
    let admitted = state
        .gate
        .admit(&query.token, scope, outbound_tx)
        .await
        .map_err(ApiError::from)?;

    // 如果客户端在升级完成前消失，outbound_rx 随闭包丢弃，
    // 通道关闭后下一次推送会走注销路径清掉注册
    Ok(ws.on_upgrade(move |socket| WsConnection::run(socket, state, admitted, outbound_rx)))
}
