//! 会话门
//!
//! 每个新连接先过凭证校验，再过目标会话的成员检查，两者都通过
//! 才会进入连接注册表。两类拒绝是不同的错误条件，且都不会留下
//! 部分注册的连接。

use std::sync::Arc;

use domain::{ChatEvent, ConversationId, DomainError, UserId};
use tokio::sync::mpsc;

use crate::auth::IdentityVerifier;
use crate::error::ApplicationError;
use crate::membership::MembershipDirectory;
use crate::registry::{ConnectionRegistry, ConnectionToken};

/// 通过准入的连接。
#[derive(Debug, Clone, Copy)]
pub struct AdmittedConnection {
    pub token: ConnectionToken,
    pub user_id: UserId,
    pub scope: ConversationId,
}

pub struct SessionGate {
    verifier: Arc<dyn IdentityVerifier>,
    membership: Arc<dyn MembershipDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl SessionGate {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        membership: Arc<dyn MembershipDirectory>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            verifier,
            membership,
            registry,
        }
    }

    /// 准入一次连接尝试。
    pub async fn admit(
        &self,
        credential: &str,
        scope: ConversationId,
        outbound: mpsc::Sender<ChatEvent>,
    ) -> Result<AdmittedConnection, ApplicationError> {
        let user_id = self
            .verifier
            .verify(credential)
            .await?
            .ok_or(DomainError::InvalidCredential)?;

        if !self.membership.is_member(user_id, scope).await? {
            tracing::warn!(user_id = %user_id, scope = %scope, "连接被拒绝：不是会话成员");
            return Err(DomainError::NotAuthorized.into());
        }

        let token = self.registry.register(user_id, scope, outbound).await;
        tracing::info!(user_id = %user_id, scope = %scope, "连接已准入");

        Ok(AdmittedConnection {
            token,
            user_id,
            scope,
        })
    }
}
