//! 会话实体定义
//!
//! 单聊在首次联系时创建且同一对用户只有一个实例；群聊由创建者显式建立，
//! 创建者拥有成员管理权限。投递核心只读取成员集，从不修改。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Room,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub members: Vec<UserId>,
    /// 群聊创建者，拥有成员管理权限。单聊没有创建者。
    pub creator: Option<UserId>,
    pub name: Option<String>,
    pub created_at: Timestamp,
}

impl Conversation {
    /// 创建单聊会话。成员恰好两人且不能相同。
    pub fn new_direct(
        id: ConversationId,
        a: UserId,
        b: UserId,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        if a == b {
            return Err(DomainError::invalid_argument(
                "members",
                "direct conversation requires two distinct users",
            ));
        }

        Ok(Self {
            id,
            kind: ConversationKind::Direct,
            members: vec![a, b],
            creator: None,
            name: None,
            created_at,
        })
    }

    /// 创建群聊。创建者自动成为成员。
    pub fn new_room(
        id: ConversationId,
        name: impl Into<String>,
        creator: UserId,
        members: Vec<UserId>,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::invalid_argument("name", "cannot be empty"));
        }

        let mut all = vec![creator];
        for member in members {
            if !all.contains(&member) {
                all.push(member);
            }
        }

        Ok(Self {
            id,
            kind: ConversationKind::Room,
            members: all,
            creator: Some(creator),
            name: Some(name),
            created_at,
        })
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }

    /// 一条消息的接收者集合：全部成员去掉发送者。
    pub fn recipients(&self, sender_id: UserId) -> Vec<UserId> {
        self.members
            .iter()
            .copied()
            .filter(|member| *member != sender_id)
            .collect()
    }

    /// 加入新成员。只对群聊有效，重复加入是幂等的空操作。
    pub fn add_member(&mut self, user_id: UserId) -> DomainResult<()> {
        if self.kind != ConversationKind::Room {
            return Err(DomainError::invalid_state(
                "direct conversations have a fixed member pair",
            ));
        }
        if !self.members.contains(&user_id) {
            self.members.push(user_id);
        }
        Ok(())
    }

    /// 单聊的无序成员对，用于唯一性约束。
    pub fn direct_pair(&self) -> Option<(UserId, UserId)> {
        if self.kind != ConversationKind::Direct {
            return None;
        }
        let (a, b) = (self.members[0], self.members[1]);
        Some(normalize_pair(a, b))
    }
}

/// 把成员对归一化为固定顺序，保证每对用户至多一个单聊。
pub fn normalize_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[test]
    fn direct_requires_distinct_members() {
        let a = user();
        let id = ConversationId::from(Uuid::new_v4());
        assert!(Conversation::new_direct(id, a, a, Utc::now()).is_err());
    }

    #[test]
    fn direct_pair_is_order_insensitive() {
        let (a, b) = (user(), user());
        let id = ConversationId::from(Uuid::new_v4());
        let left = Conversation::new_direct(id, a, b, Utc::now()).unwrap();
        let right = Conversation::new_direct(id, b, a, Utc::now()).unwrap();
        assert_eq!(left.direct_pair(), right.direct_pair());
    }

    #[test]
    fn recipients_exclude_sender() {
        let (a, b, c) = (user(), user(), user());
        let room = Conversation::new_room(
            ConversationId::from(Uuid::new_v4()),
            "general",
            a,
            vec![b, c],
            Utc::now(),
        )
        .unwrap();

        let recipients = room.recipients(a);
        assert_eq!(recipients.len(), 2);
        assert!(!recipients.contains(&a));
    }

    #[test]
    fn room_membership_is_idempotent() {
        let (a, b) = (user(), user());
        let mut room = Conversation::new_room(
            ConversationId::from(Uuid::new_v4()),
            "general",
            a,
            vec![],
            Utc::now(),
        )
        .unwrap();

        room.add_member(b).unwrap();
        room.add_member(b).unwrap();
        assert_eq!(room.members.len(), 2);
    }

    #[test]
    fn direct_membership_is_fixed() {
        let (a, b, c) = (user(), user(), user());
        let mut direct =
            Conversation::new_direct(ConversationId::from(Uuid::new_v4()), a, b, Utc::now())
                .unwrap();
        assert!(direct.add_member(c).is_err());
    }
}
