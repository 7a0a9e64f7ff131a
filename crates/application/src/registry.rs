//! 连接注册表
//!
//! 维护用户到活跃连接集合的映射。一个用户可以同时持有多个连接
//! （多标签页、多设备），每个连接绑定到唯一的会话作用域。
//! 按用户 id 分片加锁，单个用户连接集的变更互斥，不同用户互不阻塞。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use domain::{ChatEvent, ConversationId, UserId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::presence::PresenceTracker;

const SHARD_COUNT: usize = 16;

/// 连接句柄。注销用它定位连接，内部携带属主用户以路由到正确分片。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken {
    user_id: UserId,
    id: Uuid,
}

impl ConnectionToken {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

#[derive(Clone)]
struct ConnectionEntry {
    scope: ConversationId,
    outbound: mpsc::Sender<ChatEvent>,
}

/// 某个活跃连接的出站端点，扇出时从注册表取出。
#[derive(Clone)]
pub struct LiveConnection {
    pub token: ConnectionToken,
    pub scope: ConversationId,
    pub outbound: mpsc::Sender<ChatEvent>,
}

type Shard = RwLock<HashMap<UserId, HashMap<Uuid, ConnectionEntry>>>;

pub struct ConnectionRegistry {
    shards: Vec<Shard>,
    presence: Arc<PresenceTracker>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards, presence }
    }

    fn shard_for(&self, user_id: UserId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    /// 注册一个新连接。占用从 0 变为非 0 时触发一次上线跳变。
    pub async fn register(
        &self,
        user_id: UserId,
        scope: ConversationId,
        outbound: mpsc::Sender<ChatEvent>,
    ) -> ConnectionToken {
        let token = ConnectionToken {
            user_id,
            id: Uuid::new_v4(),
        };

        let mut shard = self.shard_for(user_id).write().await;
        let connections = shard.entry(user_id).or_default();
        let was_empty = connections.is_empty();
        connections.insert(token.id, ConnectionEntry { scope, outbound });
        if was_empty {
            self.presence.connection_opened(user_id);
        }
        drop(shard);

        tracing::debug!(user_id = %user_id, scope = %scope, "连接已注册");
        token
    }

    /// 注销连接。幂等：对已移除的句柄再次调用是空操作。
    /// 占用从非 0 变为 0 时触发一次下线跳变。
    pub async fn unregister(&self, token: ConnectionToken) -> bool {
        let mut shard = self.shard_for(token.user_id).write().await;
        let Some(connections) = shard.get_mut(&token.user_id) else {
            return false;
        };
        if connections.remove(&token.id).is_none() {
            return false;
        }
        if connections.is_empty() {
            shard.remove(&token.user_id);
            self.presence.connection_closed(token.user_id);
        }
        drop(shard);

        tracing::debug!(user_id = %token.user_id, "连接已注销");
        true
    }

    pub async fn connections_for(&self, user_id: UserId) -> Vec<LiveConnection> {
        let shard = self.shard_for(user_id).read().await;
        shard
            .get(&user_id)
            .map(|connections| {
                connections
                    .iter()
                    .map(|(id, entry)| LiveConnection {
                        token: ConnectionToken { user_id, id: *id },
                        scope: entry.scope,
                        outbound: entry.outbound.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 取某用户绑定在指定会话作用域上的活跃连接。
    pub async fn scoped_connections(
        &self,
        user_id: UserId,
        scope: ConversationId,
    ) -> Vec<LiveConnection> {
        let mut connections = self.connections_for(user_id).await;
        connections.retain(|connection| connection.scope == scope);
        connections
    }

    pub async fn scope_of(&self, token: ConnectionToken) -> Option<ConversationId> {
        let shard = self.shard_for(token.user_id).read().await;
        shard
            .get(&token.user_id)
            .and_then(|connections| connections.get(&token.id))
            .map(|entry| entry.scope)
    }

    /// 当前占用数，用于一致性校验。
    pub async fn occupancy(&self, user_id: UserId) -> usize {
        let shard = self.shard_for(user_id).read().await;
        shard.get(&user_id).map(|c| c.len()).unwrap_or(0)
    }
}
