//! WebSocket 与 REST 传输层
//!
//! 薄壳：准入走会话门，消息操作全部委托给投递引擎。

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;
pub mod ws_connection;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
