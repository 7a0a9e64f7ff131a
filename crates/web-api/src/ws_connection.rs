//! WebSocket 连接主循环
//!
//! 每个连接两个任务：发送任务统一串行化对 socket 的写操作
//! （注册表推来的事件和本地命令走同一个通道，保证出站顺序），
//! 接收任务解析客户端帧并委托投递引擎。任一任务结束即拆除连接。

use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{MessageBody, MessageId};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use application::{AdmittedConnection, SendMessageRequest};

use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::ClientFrame;

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

pub struct WsConnection;

impl WsConnection {
    /// 运行连接直到任一方向关闭。
    pub async fn run(
        socket: WebSocket,
        state: AppState,
        admitted: AdmittedConnection,
        mut outbound_rx: mpsc::Receiver<domain::ChatEvent>,
    ) {
        tracing::info!(
            user_id = %admitted.user_id,
            scope = %admitted.scope,
            "WebSocket 连接已建立"
        );

        let (mut sender, mut incoming) = socket.split();

        // 进入作用域即向其他成员广播上线
        state
            .chat_service
            .broadcast_presence(admitted.user_id, admitted.scope, true)
            .await;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let send_task = {
            let cmd_tx_for_push = cmd_tx.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(cmd) = cmd_rx.recv() => {
                            match cmd {
                                WsCommand::SendText(text) => {
                                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                WsCommand::SendPong(data) => {
                                    if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        event = outbound_rx.recv() => {
                            match event {
                                Some(event) => {
                                    let payload = match serde_json::to_string(&event) {
                                        Ok(json) => json,
                                        Err(err) => {
                                            tracing::warn!(error = %err, "事件序列化失败");
                                            continue;
                                        }
                                    };
                                    if cmd_tx_for_push.send(WsCommand::SendText(payload)).await.is_err() {
                                        break;
                                    }
                                }
                                // 注册表侧已经拆除了这个连接
                                None => break,
                            }
                        }
                    }
                }
                tracing::debug!("WebSocket发送任务结束");
            })
        };

        // 接收任务：处理来自客户端的帧
        let recv_task = {
            let state = state.clone();
            let cmd_tx = cmd_tx.clone();

            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    match message {
                        WsMessage::Close(_) => {
                            tracing::debug!("客户端发起关闭");
                            break;
                        }
                        WsMessage::Ping(data) => {
                            if cmd_tx
                                .send(WsCommand::SendPong(data.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => {}
                        WsMessage::Text(text) => {
                            Self::handle_frame(&state, admitted, &cmd_tx, text.as_str()).await;
                        }
                        WsMessage::Binary(_) => {
                            tracing::debug!("忽略二进制帧");
                        }
                    }
                }
                tracing::debug!("WebSocket接收任务结束");
            })
        };

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            _ = send_task => {}
            _ = recv_task => {}
        }

        // 拆除连接：注销是幂等的，之后广播下线
        state.registry.unregister(admitted.token).await;
        state
            .chat_service
            .broadcast_presence(admitted.user_id, admitted.scope, false)
            .await;

        tracing::info!(
            user_id = %admitted.user_id,
            scope = %admitted.scope,
            "WebSocket 连接已断开"
        );
    }

    /// 处理一个客户端帧。错误通过 error 帧回给客户端，
    /// 不影响连接本身。
    async fn handle_frame(
        state: &AppState,
        admitted: AdmittedConnection,
        cmd_tx: &mpsc::Sender<WsCommand>,
        text: &str,
    ) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                Self::send_error(cmd_tx, "BAD_FRAME", &format!("unparseable frame: {err}"))
                    .await;
                return;
            }
        };

        match frame {
            ClientFrame::Send { body, reply_to } => {
                // 文本正文在边界上重新校验
                let body = match body {
                    MessageBody::Text { text } => match MessageBody::text(text.as_str()) {
                        Ok(body) => body,
                        Err(err) => {
                            Self::send_error(cmd_tx, "INVALID_ARGUMENT", &err.to_string()).await;
                            return;
                        }
                    },
                    other => other,
                };

                let request = SendMessageRequest {
                    conversation_id: admitted.scope,
                    sender_id: admitted.user_id,
                    body,
                    reply_to: reply_to.map(MessageId::new),
                };

                match state.chat_service.submit(request).await {
                    Ok(message) => {
                        // 发送确认直接回给提交者本人的连接，不走扇出
                        let ack = json!({ "type": "ack", "message": message });
                        Self::send_json(cmd_tx, ack.to_string()).await;
                    }
                    Err(err) => {
                        let api_error = ApiError::from(err);
                        Self::send_error(cmd_tx, api_error.code(), "message rejected").await;
                    }
                }
            }
            ClientFrame::StatusUpdate { message_id, status } => {
                let result = state
                    .chat_service
                    .update_status(
                        admitted.user_id,
                        admitted.scope,
                        MessageId::new(message_id),
                        status,
                    )
                    .await;
                if let Err(err) = result {
                    let api_error = ApiError::from(err);
                    Self::send_error(cmd_tx, api_error.code(), "status update rejected").await;
                }
            }
            ClientFrame::Typing { is_typing } => {
                state
                    .chat_service
                    .notify_typing(admitted.user_id, admitted.scope, is_typing)
                    .await;
            }
        }
    }

    async fn send_json(cmd_tx: &mpsc::Sender<WsCommand>, payload: String) {
        let _ = cmd_tx.send(WsCommand::SendText(payload)).await;
    }

    async fn send_error(cmd_tx: &mpsc::Sender<WsCommand>, code: &str, message: &str) {
        let payload = json!({ "type": "error", "code": code, "message": message });
        Self::send_json(cmd_tx, payload.to_string()).await;
    }
}
