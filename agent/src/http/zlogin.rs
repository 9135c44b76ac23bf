//! `/zlogin/*` endpoints: start/list/stop console sessions, plus the
//! WebSocket that carries the bidirectional console byte stream. All of
//! this is a thin projection over the Console Multiplexer (§4.5) — the PTY
//! itself is never owned by an HTTP handler.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use tracing::warn;

use shared::api::{ZloginSessionResponse, ZloginSessionSummary};
use shared::console::ConsoleEvent;
use shared::error::AgentError;

use crate::store::tables;

use super::{validate_api_key, ApiError, AppState};

pub async fn start_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ZloginSessionResponse>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    {
        let mut store = state.ctx.store.lock().await;
        let conn = store.get_connection()?;
        if tables::zones::get_zone(conn, &name)?.is_none() {
            return Err(AgentError::not_found(format!("zone '{name}' not found")).into());
        }
    }

    let handle = state.ctx.console.get_or_create(&name).await?;
    let status = if handle.is_alive() { "active" } else { "failed" };

    Ok((
        StatusCode::CREATED,
        Json(ZloginSessionResponse {
            session_id: handle.session_id(),
            zone_name: name.clone(),
            status: status.to_string(),
            websocket_path: format!("/zlogin/sessions/{}", handle.session_id()),
        }),
    ))
}

pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<ZloginSessionSummary>>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let sessions = store.list_console_sessions()?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| ZloginSessionSummary {
                session_id: s.id,
                zone_name: s.zone_name,
                status: s.status.as_str().to_string(),
                started_at: s.started_at,
            })
            .collect(),
    ))
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let zone_name = {
        let mut store = state.ctx.store.lock().await;
        let conn = store.get_connection()?;
        tables::console::get_session(conn, id)?
            .ok_or_else(|| AgentError::not_found(format!("zlogin session {id} not found")))?
            .zone_name
    };

    state.ctx.console.destroy(&zone_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /zlogin/sessions/{id}` upgraded to a WebSocket. Replays the
/// in-memory live buffer on connect, then streams PTY output and forwards
/// inbound client bytes to the PTY's writer.
pub async fn websocket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let zone_name = {
        let mut store = state.ctx.store.lock().await;
        let conn = store.get_connection()?;
        tables::console::get_session(conn, id)?
            .ok_or_else(|| AgentError::not_found(format!("zlogin session {id} not found")))?
            .zone_name
    };

    let handle = state.ctx.console.get_or_create(&zone_name).await?;
    let replay_bytes = state.config.console.replay_lines * 80;

    Ok(ws.on_upgrade(move |socket| async move {
        run_console_socket(socket, handle, replay_bytes).await;
    }).into_response())
}

async fn run_console_socket(
    socket: WebSocket,
    handle: std::sync::Arc<crate::console::ConsoleHandle>,
    replay_bytes: usize,
) {
    let (mut sink, mut stream) = socket.split();
    let (replay, mut events) = handle.subscribe(replay_bytes);

    if !replay.is_empty() && sink.send(Message::Binary(replay.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = handle.write_input(&data) {
                            warn!(zone_name = handle.zone_name(), error = %e, "writing console input failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle.write_input(text.as_bytes()) {
                            warn!(zone_name = handle.zone_name(), error = %e, "writing console input failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(zone_name = handle.zone_name(), error = %e, "console websocket read error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(ConsoleEvent::Output(chunk)) => {
                        if sink.send(Message::Binary(chunk.data.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(ConsoleEvent::AutomationActive { active, .. }) => {
                        let marker = format!("{{\"automation_active\":{active}}}");
                        if sink.send(Message::Text(marker.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Subscriber fell behind the bounded channel; tell it to
                        // reconnect rather than silently skip ahead.
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        if !handle.is_alive() {
            break;
        }
    }
}
