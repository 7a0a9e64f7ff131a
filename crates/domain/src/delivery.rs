//! 消息投递状态追踪
//!
//! 每个（消息，接收者）对维护一条投递记录，状态沿
//! `sent -> delivered -> read` 单调推进，禁止回退。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, Timestamp, UserId};

/// 投递状态枚举，顺序即推进方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Sent => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Read => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            _ => None,
        }
    }
}

impl PartialOrd for DeliveryState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeliveryState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// 单个接收者的投递记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub state: DeliveryState,
    pub updated_at: Timestamp,
}

impl DeliveryRecord {
    pub fn new_sent(message_id: MessageId, user_id: UserId, at: Timestamp) -> Self {
        Self {
            message_id,
            user_id,
            state: DeliveryState::Sent,
            updated_at: at,
        }
    }

    /// 状态推进。返回是否发生实际变化；回退返回错误。
    ///
    /// 重复设置相同状态视为幂等的空操作，并发的重复确认不应报错。
    pub fn advance(&mut self, to: DeliveryState, at: Timestamp) -> DomainResult<bool> {
        use std::cmp::Ordering;

        match to.cmp(&self.state) {
            Ordering::Greater => {
                self.state = to;
                self.updated_at = at;
                Ok(true)
            }
            Ordering::Equal => Ok(false),
            Ordering::Less => Err(DomainError::invalid_state(format!(
                "delivery status cannot regress from {} to {}",
                self.state.as_str(),
                to.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> DeliveryRecord {
        DeliveryRecord::new_sent(MessageId::new(1), UserId::from(Uuid::new_v4()), Utc::now())
    }

    #[test]
    fn state_ordering() {
        assert!(DeliveryState::Sent < DeliveryState::Delivered);
        assert!(DeliveryState::Delivered < DeliveryState::Read);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut rec = record();
        assert!(rec.advance(DeliveryState::Delivered, Utc::now()).unwrap());
        assert!(rec.advance(DeliveryState::Read, Utc::now()).unwrap());

        // 回退被拒绝，状态保持不变
        let err = rec.advance(DeliveryState::Delivered, Utc::now());
        assert!(matches!(err, Err(DomainError::InvalidState { .. })));
        assert_eq!(rec.state, DeliveryState::Read);
    }

    #[test]
    fn advance_same_state_is_noop() {
        let mut rec = record();
        rec.advance(DeliveryState::Delivered, Utc::now()).unwrap();
        assert!(!rec.advance(DeliveryState::Delivered, Utc::now()).unwrap());
    }

    #[test]
    fn skipping_delivered_is_allowed() {
        // 接收者可以直接确认已读，跳过中间状态
        let mut rec = record();
        assert!(rec.advance(DeliveryState::Read, Utc::now()).unwrap());
        assert_eq!(rec.state, DeliveryState::Read);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            DeliveryState::Sent,
            DeliveryState::Delivered,
            DeliveryState::Read,
        ] {
            assert_eq!(DeliveryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DeliveryState::parse("recalled"), None);
    }
}
