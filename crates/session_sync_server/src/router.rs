//! Minimal Axum router proving the four core components interoperate end
//! to end: plain HTTP handlers for the eight Sync Engine operations, and a
//! single WebSocket upgrade route that hands the connection to a
//! `delivery_plane::ConnectionTask`. Routing/CORS/rate-limiting beyond this
//! are named external collaborators (spec.md §1 Non-goals), not implemented
//! here.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{
            WebSocket,
            WebSocketUpgrade,
        },
        Path,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        get,
        post,
    },
    Json,
    Router,
};
use delivery_plane::{
    ClientMessage,
    ConnectionRegistry,
    ConnectionTask,
    ServerMessage,
};
use errors::ErrorMetadataAnyhowExt;
use fanout_bus::VersionGate;
use runtime::prod::ProdRuntime;
use serde_json::json;
use sync_engine::{
    SessionConfig,
    SessionId,
    SwitchCycleResult,
    SyncEngine,
};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine<ProdRuntime>,
    pub connections: Arc<ConnectionRegistry>,
    pub runtime: ProdRuntime,
    pub shutdown_rx: async_broadcast::Receiver<common::shutdown::ShutdownMessage>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/start", post(start_session))
        .route("/sessions/{id}/switch_cycle", post(switch_cycle))
        .route("/sessions/{id}/pause", post(pause_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/complete", post(complete_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/ws", get(websocket_upgrade))
        .with_state(state)
}

fn anyhow_response(e: anyhow::Error) -> Response {
    let status = e.http_status();
    let body = Json(json!({
        "code": e.short_msg(),
        "message": format!("{e:#}"),
    }));
    (status, body).into_response()
}

async fn create_session(
    State(state): State<AppState>,
    Json(config): Json<SessionConfig>,
) -> Response {
    match state.engine.create(config) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn start_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.start(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

#[derive(serde::Deserialize, Default)]
struct SwitchCycleBody {
    next_participant_id: Option<SessionId>,
}

async fn switch_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<SwitchCycleBody>>,
) -> Response {
    let next_participant_id = body.map(|Json(b)| b.next_participant_id).unwrap_or(None);
    let result: anyhow::Result<SwitchCycleResult> = state.engine.switch_cycle(id, next_participant_id);
    match result {
        Ok(result) => Json(result).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn pause_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.pause(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn resume_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.resume(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn complete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.complete(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.get_current_state(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.delete(id) {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => anyhow_response(e),
    }
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_websocket(socket, id, state))
}

async fn serve_websocket(socket: WebSocket, session_id: SessionId, state: AppState) {
    let task = ConnectionTask::new(
        state.runtime.clone(),
        session_id,
        state.connections.clone(),
        state.engine.bus().clone(),
        state.engine.clone(),
        Arc::new(VersionGate::new()),
        common::knobs::keepalive_interval(),
    );

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel::<ClientMessage>();
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();

    let (mut sink, mut stream) = futures::StreamExt::split(socket);

    let reader = async move {
        while let Some(Ok(msg)) = futures::StreamExt::next(&mut stream).await {
            if let axum::extract::ws::Message::Text(text) = msg {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                    if inbound_tx.send(client_msg).is_err() {
                        break;
                    }
                }
            }
        }
    };

    let writer = async move {
        let mut outbound_rx = outbound_rx;
        while let Some(msg) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if futures::SinkExt::send(&mut sink, axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    };

    tokio::spawn(reader);
    tokio::spawn(writer);
    task.run(inbound_rx, outbound_tx, state.shutdown_rx.clone()).await;
}
