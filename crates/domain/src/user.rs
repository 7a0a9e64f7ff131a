//! 用户在线状态
//!
//! 用户身份与凭证数据归外部身份服务所有，本核心只推导在线状态。
//! 在线标志不是存储的事实，每次查询都由连接注册表的占用情况重算。

use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 某一时刻的在线状态快照，由在线追踪器组装。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<Timestamp>,
}
