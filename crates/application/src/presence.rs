//! 在线状态追踪器
//!
//! 在线与否由连接占用推导：注册表在占用 0 与非 0 之间切换时
//! 同步通知本追踪器，除此之外没有任何状态来源。last_seen 只在
//! 最后一个连接关闭的瞬间记录一次，不随消息或心跳刷新。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::{PresenceSnapshot, Timestamp, UserId};
use tokio::sync::broadcast;

use crate::clock::Clock;

/// 在线状态的跳变边沿。只在 0 与非 0 之间切换时发出，
/// 多设备场景下加开第二个连接不会产生事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Online {
        user_id: UserId,
    },
    Offline {
        user_id: UserId,
        last_seen: Timestamp,
    },
}

#[derive(Default)]
struct PresenceState {
    occupancy: HashMap<UserId, usize>,
    last_seen: HashMap<UserId, Timestamp>,
}

pub struct PresenceTracker {
    state: Mutex<PresenceState>,
    transitions: broadcast::Sender<PresenceTransition>,
    clock: Arc<dyn Clock>,
}

impl PresenceTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(PresenceState::default()),
            transitions,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册表注册连接时同步调用。
    pub(crate) fn connection_opened(&self, user_id: UserId) {
        let mut state = self.lock();
        let count = state.occupancy.entry(user_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            // 订阅者缺席时发送失败是正常情况
            let _ = self.transitions.send(PresenceTransition::Online { user_id });
            tracing::debug!(user_id = %user_id, "用户上线");
        }
    }

    /// 注册表注销连接时同步调用。
    pub(crate) fn connection_closed(&self, user_id: UserId) {
        let mut state = self.lock();
        let Some(count) = state.occupancy.get_mut(&user_id) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.occupancy.remove(&user_id);
            let now = self.clock.now();
            state.last_seen.insert(user_id, now);
            let _ = self.transitions.send(PresenceTransition::Offline {
                user_id,
                last_seen: now,
            });
            tracing::debug!(user_id = %user_id, "用户下线");
        }
    }

    /// 查询从不失败，未知用户报告离线且没有 last_seen。
    pub fn is_online(&self, user_id: UserId) -> bool {
        let state = self.lock();
        state.occupancy.get(&user_id).copied().unwrap_or(0) > 0
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<Timestamp> {
        let state = self.lock();
        state.last_seen.get(&user_id).copied()
    }

    pub fn snapshot(&self, user_id: UserId) -> PresenceSnapshot {
        let state = self.lock();
        PresenceSnapshot {
            user_id,
            is_online: state.occupancy.get(&user_id).copied().unwrap_or(0) > 0,
            last_seen: state.last_seen.get(&user_id).copied(),
        }
    }

    /// 订阅上线/下线边沿。
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceTransition> {
        self.transitions.subscribe()
    }
}
