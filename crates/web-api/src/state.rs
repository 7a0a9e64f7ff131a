use std::sync::Arc;

use application::{
    ChatService, ConnectionRegistry, ConversationRepository, IdentityVerifier, PresenceTracker,
    SessionGate,
};
use config::DeliveryConfig;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub gate: Arc<SessionGate>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub delivery: DeliveryConfig,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat_service: Arc<ChatService>,
        gate: Arc<SessionGate>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        conversations: Arc<dyn ConversationRepository>,
        verifier: Arc<dyn IdentityVerifier>,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            chat_service,
            gate,
            registry,
            presence,
            conversations,
            verifier,
            delivery,
        }
    }
}
