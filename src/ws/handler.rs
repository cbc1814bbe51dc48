//! WebSocket upgrade handler

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::game::authority::DisconnectReason;
use crate::game::broadcast::Outbound;
use crate::game::input::ConnectionId;
use crate::util::rate_limit::FrameLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{
    decode_client, ClientMsg, ConnectRequest, ErrorCode, MessageType, Ping, ProtocolError,
    ServerMsg,
};
use crate::ws::supervisor::{HeartbeatAction, HeartbeatMonitor};

/// Time allowed between upgrade and `CLIENT_CONNECT`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time the writer gets to flush after the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection = state.next_connection_id();
    debug!(connection, "New WebSocket connection");

    let (ws_sink, mut ws_stream) = socket.split();

    // Outbox first, so the welcome has somewhere to go
    let outbox = state.game.broadcaster.register(connection);
    let mut writer = tokio::spawn(write_outbox(connection, ws_sink, outbox));

    let request = match timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws_stream)).await {
        Ok(Ok(Some(request))) => Some(request),
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            warn!(connection, error = %e, "Bad handshake");
            state
                .game
                .broadcaster
                .close(connection, ErrorCode::ProtocolError, e.to_string());
            None
        }
        Err(_) => {
            info!(connection, "Handshake timed out");
            state.game.broadcaster.close(
                connection,
                ErrorCode::HandshakeTimeout,
                "no CLIENT_CONNECT received",
            );
            None
        }
    };

    let reason = match request {
        Some(request) => match state.game.join(connection, request).await {
            Ok(welcome) => {
                info!(connection, handle = %welcome.handle, "Session established");
                run_session(connection, &state, &mut ws_stream, &mut writer).await
            }
            Err(e) => {
                // the loop has already sent the error unless it is gone
                state.game.broadcaster.close(connection, e.code(), e.to_string());
                DisconnectReason::Closed
            }
        },
        None => DisconnectReason::Closed,
    };

    state.game.disconnect(connection, reason).await;

    if !writer.is_finished() && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(connection, ?reason, "WebSocket connection closed");
}

/// Wait for the first protocol frame, which must be `CLIENT_CONNECT`.
/// Returns `None` if the peer goes away first.
async fn read_handshake(
    ws_stream: &mut SplitStream<WebSocket>,
) -> Result<Option<ConnectRequest>, ProtocolError> {
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return match decode_client(&text)?.message {
                    ClientMsg::ClientConnect(request) => Ok(Some(request)),
                    other => Err(ProtocolError::WrongDirection(client_kind(&other))),
                };
            }
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
        }
    }
    Ok(None)
}

fn client_kind(msg: &ClientMsg) -> MessageType {
    match msg {
        ClientMsg::ClientConnect(_) => MessageType::ClientConnect,
        ClientMsg::PlayerInput(_) => MessageType::PlayerInput,
        ClientMsg::ChatMessage(_) => MessageType::ChatMessage,
        ClientMsg::PingRequest(_) => MessageType::PingRequest,
        ClientMsg::PingResponse(_) => MessageType::PingResponse,
    }
}

/// Reader loop for an admitted connection, with the heartbeat alongside
async fn run_session(
    connection: ConnectionId,
    state: &AppState,
    ws_stream: &mut SplitStream<WebSocket>,
    writer: &mut tokio::task::JoinHandle<()>,
) -> DisconnectReason {
    let game = &state.game;
    let limiter = FrameLimiter::new(state.config.max_frame_rate);
    let mut monitor = HeartbeatMonitor::new(state.config.heartbeat_miss_limit);

    let mut heartbeat = interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection, "Received binary message, ignoring");
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return DisconnectReason::Closed,
                    Some(Err(e)) => {
                        debug!(connection, error = %e, "WebSocket error");
                        return DisconnectReason::Closed;
                    }
                };

                if !limiter.check_frame() {
                    warn!(connection, "Frame rate exceeded, dropping frame");
                    continue;
                }

                let envelope = match decode_client(&text) {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_fatal() => {
                        warn!(connection, error = %e, "Fatal protocol error");
                        game.broadcaster.close(connection, ErrorCode::ProtocolError, e.to_string());
                        return DisconnectReason::ProtocolError;
                    }
                    Err(e) => {
                        debug!(connection, error = %e, "Dropped malformed frame");
                        continue;
                    }
                };

                match envelope.message {
                    ClientMsg::ClientConnect(_) => {
                        let e = ProtocolError::UnexpectedHandshake(MessageType::ClientConnect);
                        game.broadcaster.close(connection, ErrorCode::ProtocolError, e.to_string());
                        return DisconnectReason::ProtocolError;
                    }
                    ClientMsg::PlayerInput(command) => {
                        if let Err(rejection) = game.gate.submit(connection, command) {
                            debug!(connection, sequence = command.sequence, %rejection, "Input rejected");
                        }
                    }
                    ClientMsg::ChatMessage(chat) => game.chat(connection, chat.text).await,
                    ClientMsg::PingRequest(Ping { t }) => {
                        let _ = game.broadcaster.send_to(connection, &ServerMsg::PingResponse(Ping { t }));
                    }
                    ClientMsg::PingResponse(Ping { t }) => {
                        monitor.on_response(t, unix_millis());
                    }
                }
            }
            _ = heartbeat.tick() => {
                match monitor.on_interval(unix_millis()) {
                    HeartbeatAction::SendPing(t) => {
                        let _ = game.broadcaster.send_to(connection, &ServerMsg::PingRequest(Ping { t }));
                    }
                    HeartbeatAction::Disconnect => {
                        info!(connection, missed = monitor.missed(), "Heartbeat lost");
                        return DisconnectReason::HeartbeatTimeout;
                    }
                }
            }
            _ = &mut *writer => {
                // the loop closed this connection (relegation, takeover)
                return DisconnectReason::Closed;
            }
        }
    }
}

/// Writer task: outbox -> WebSocket
async fn write_outbox(
    connection: ConnectionId,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outbox.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                    debug!(connection, error = %e, "WebSocket send failed");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = ws_sink.close().await;
}
