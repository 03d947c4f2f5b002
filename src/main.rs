use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use talkback_server::auth::TokenResolver;
use talkback_server::config::Config;
use talkback_server::groups::GroupStore;
use talkback_server::handlers;
use talkback_server::mirror::StatusMirror;
use talkback_server::presence::PresenceManager;
use talkback_server::state::AppState;
use talkback_server::store::{keys, Store};
use talkback_server::websocket::{self, ClientRegistry, DashboardSet};

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env().expect("Failed to load configuration"));

    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "talkback_server=info,tower_http=info".parse().unwrap());

    if config.is_dev {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }

    info!("Talkback router starting...");
    info!("Configuration loaded");

    // Store connectivity is a hard startup requirement; exit nonzero without it.
    let store = Store::connect(&config.redis_url())
        .await
        .expect("Failed to connect to the shared store");

    // Expired-key notifications drive the silent-offline path. Degraded but
    // survivable when the store refuses the configuration.
    if config.janitor_leader {
        if let Err(e) = store.enable_keyspace_events().await {
            tracing::warn!(
                error = ?e,
                "Could not enable keyspace expiry events; silent clients will not be expired"
            );
        }
    }

    let subscriber = store.spawn_subscriber(vec![
        keys::CH_PRESENCE_ONLINE.to_string(),
        keys::CH_PRESENCE_OFFLINE.to_string(),
        keys::CH_PRESENCE_UPDATES.to_string(),
        keys::CH_KEY_EXPIRED.to_string(),
    ]);

    let mirror = if config.mirror_enabled {
        StatusMirror::new(config.mirror_endpoint.clone())
    } else {
        StatusMirror::disabled()
    };

    let presence = PresenceManager::new(
        store.clone(),
        mirror,
        config.presence_ttl_secs,
        config.presence_enabled,
    );
    let expiry_listener = presence.spawn_expiry_listener(store.subscribe_events());

    let groups = GroupStore::new(store.clone());
    let janitor = config
        .janitor_leader
        .then(|| groups.spawn_janitor(config.clean_interval, config.clean_groups_amount));
    // Lock inspection judges holders by their presence key, so it only runs
    // where presence is on.
    let lock_inspector = (config.janitor_leader && config.presence_enabled).then(|| {
        groups.spawn_lock_inspector(config.group_inspect_interval, config.clean_groups_amount)
    });

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        presence,
        groups,
        clients: ClientRegistry::new(),
        dashboards: DashboardSet::new(),
        resolver: Arc::new(TokenResolver::new(
            config.use_authentication,
            config.secret_key.clone(),
        )),
    };

    let presence_bridge = websocket::spawn_presence_bridge(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/api/presence/status", post(handlers::presence::bulk_status))
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let addr = config.server_addr();
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // On SIGINT: stop accepting, then ask every live connection to close so
    // the serve future can drain.
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install signal handler");
            info!("Shutdown signal received; closing connections");
            shutdown_state.clients.close_all().await;
            shutdown_state.dashboards.close_all().await;
        })
        .await
        .expect("Server failed");

    // Background tasks go down after the last connection.
    presence_bridge.abort();
    expiry_listener.abort();
    if let Some(janitor) = janitor {
        janitor.abort();
    }
    if let Some(inspector) = lock_inspector {
        inspector.abort();
    }
    subscriber.abort();

    info!("Shutdown complete");
}
