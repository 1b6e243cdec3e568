use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{Envelope, PrivateRecord},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;
mod hub;

use config::{load_settings, normalize_database_url};
use hub::Hub;

pub(crate) struct AppState {
    pub(crate) hub: Hub,
    pub(crate) storage: Storage,
}

const MAX_HISTORY_BODY_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = Arc::new(AppState {
        hub: Hub::new(),
        storage,
    });
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chat", get(ws_handler))
        .route("/messages", post(message_history))
        .layer(RequestBodyLimitLayer::new(MAX_HISTORY_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub::run_client(state, socket))
}

async fn message_history(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Envelope>,
) -> Result<Json<Vec<PrivateRecord>>, (StatusCode, Json<ApiError>)> {
    let (to, from) = match body {
        Envelope::MsgHistory { to, from } => (to, from),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(
                    ErrorCode::Validation,
                    "expected a msgHistory envelope",
                )),
            ))
        }
    };

    let history = state.storage.history_between(&to, &from).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;

    Ok(Json(
        history
            .into_iter()
            .map(|message| PrivateRecord {
                from: message.sender,
                msg: message.text,
            })
            .collect(),
    ))
}
