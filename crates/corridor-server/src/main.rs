use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use corridor_blobs::BlobStore;
use corridor_realtime::Dispatcher;
use corridor_session::Backend;
use corridor_store::Database;

mod notify;
mod ws;

/// Attachment size cap, 25 MiB.
const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Clone)]
struct ServerState {
    backend: Backend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corridor=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("CORRIDOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CORRIDOR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let db_path = std::env::var("CORRIDOR_DB_PATH").unwrap_or_else(|_| "corridor.db".into());
    let blob_dir = std::env::var("CORRIDOR_BLOB_DIR").unwrap_or_else(|_| "blobs".into());
    let public_url = std::env::var("CORRIDOR_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://{}:{}", host, port));
    let ping_url = std::env::var("CORRIDOR_PING_URL").ok();
    let ping_token = std::env::var("CORRIDOR_PING_TOKEN").ok();

    // Init storage
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let blobs = BlobStore::new(
        PathBuf::from(&blob_dir),
        format!("{}/files", public_url.trim_end_matches('/')),
        MAX_ATTACHMENT_BYTES,
    )
    .await?;

    // Shared state
    let dispatcher = Dispatcher::new();
    let backend = Backend::new(db, dispatcher.clone(), blobs);

    // Offline phone pings, only when a gateway is configured
    if let Some(url) = ping_url {
        tokio::spawn(notify::run(backend.clone(), dispatcher, url, ping_token));
    }

    let state = ServerState { backend };

    // Routes
    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .nest_service("/files", ServeDir::new(&blob_dir))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Corridor server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Identity arrives from the edge proxy, already resolved, as query
/// parameters on the upgrade request.
#[derive(Deserialize)]
struct Identity {
    user_id: Uuid,
    name: String,
    phone: Option<String>,
    unit: Option<Uuid>,
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(identity): Query<Identity>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let Identity { user_id, name, phone, unit } = identity;
        if let Err(e) = state
            .backend
            .ensure_profile(user_id, &name, phone.as_deref(), unit)
            .await
        {
            warn!("Profile upsert for {} failed: {}", user_id, e);
            return;
        }
        ws::handle_connection(socket, state.backend, user_id, name).await;
    })
}
