//! REST 请求的 Bearer 凭证提取
//!
//! WebSocket 走会话门准入，REST 端点用同一个校验器解析
//! Authorization 头。

use axum::http::HeaderMap;
use domain::UserId;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;

    state
        .verifier
        .verify(token)
        .await
        .map_err(|err| ApiError::internal_server_error(format!("identity error: {err}")))?
        .ok_or_else(|| ApiError::unauthorized("invalid or expired credential"))
}
