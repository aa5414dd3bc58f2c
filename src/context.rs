use std::sync::Arc;

use crate::auth::AuthManager;
use crate::broker::BrokerRegistry;
use crate::config::Config;
use crate::db::DbPool;
use crate::events::ConnectionEventPublisher;
use crate::session::SessionManager;
use crate::store::MessageStore;

/// Application context containing shared dependencies.
/// Constructed once at startup; every registry lives here, never in a
/// global.
#[derive(Clone)]
pub struct AppContext {
    pub db_pool: Arc<DbPool>,
    pub store: Arc<MessageStore>,
    pub auth: Arc<AuthManager>,
    pub brokers: Arc<BrokerRegistry>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<ConnectionEventPublisher>,
    pub config: Arc<Config>,
}
