use std::sync::Arc;

use crate::auth::UserResolver;
use crate::config::Config;
use crate::groups::GroupStore;
use crate::presence::PresenceManager;
use crate::store::Store;
use crate::websocket::{ClientRegistry, DashboardSet};

/// Shared application state passed to all handlers and connection tasks.
///
/// Every field is cheaply cloneable (`Arc` internally), so cloning
/// `AppState` per request or per connection is inexpensive. The client and
/// dashboard tables are private to this instance; cross-instance state lives
/// in the store.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub presence: PresenceManager,
    pub groups: GroupStore,
    pub clients: ClientRegistry,
    pub dashboards: DashboardSet,
    pub resolver: Arc<dyn UserResolver>,
}
