//! Realtime WebSocket transport: one task per connection.
//!
//! Each accepted socket gets a [`ConnectionId`], is registered with the
//! [`ChannelRegistry`], and is split into a reader task and a writer task
//! raced against the server shutdown signal. Whatever ends the connection,
//! including a writer stuck on a slow peer, it leaves the registry exactly
//! once.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{self, CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use proto::{ChannelError, ChannelId, ConnectionId, PublishedEvent, WsMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::origin::AllowedOrigins;
use crate::registry::ChannelRegistry;

/// Queued replies and close frames waiting for the writer.
const CONTROL_CAPACITY: usize = 16;

/// How long the writer may take to flush the close frame once the
/// connection is ending. A writer stuck on a slow peer is aborted after it.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

// ─── Frame types ───────────────────────────────────────────

/// Parsed meaning of one inbound text frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Join(ChannelId),
    Ping,
    Ignore,
}

/// Why a connection ended.
#[derive(Debug)]
enum CloseReason {
    ClientClosed,
    Shutdown,
    Malformed(String),
    Transport(String),
}

// ─── Handshake ─────────────────────────────────────────────

/// Accept an upgrade request after the origin check.
pub(crate) fn accept(
    ws: WebSocketUpgrade,
    headers: &HeaderMap,
    origins: &AllowedOrigins,
    registry: Arc<ChannelRegistry>,
    outbox_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> Response {
    let origin = headers.get(header::ORIGIN);
    if !origins.allows(origin) {
        warn!(origin = ?origin, "Rejected realtime handshake from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_failed_upgrade(|e| debug!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| {
            handle_socket(socket, registry, outbox_capacity.max(1), shutdown)
        })
}

// ─── Connection lifecycle ──────────────────────────────────

/// Manages a single WebSocket connection lifecycle.
///
/// The socket is split into a reader task and a writer task. Whichever of
/// reader, writer or the shutdown signal finishes first ends the
/// connection; the writer gets [`CLOSE_GRACE`] to send the close frame and
/// is aborted otherwise. `leave` runs once on every path.
async fn handle_socket(
    socket: WebSocket,
    registry: Arc<ChannelRegistry>,
    outbox_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = ConnectionId::new();
    let (outbox_tx, outbox_rx) = mpsc::channel::<Arc<PublishedEvent>>(outbox_capacity);
    registry.register(id, outbox_tx);
    info!(connection_id = %id, "Realtime client connected");

    let (sink, stream) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_CAPACITY);
    if let Some(greeting) = encode(&WsMessage::Connected { connection_id: id }) {
        let _ = control_tx.try_send(greeting);
    }

    let mut write_task = tokio::spawn(write_loop(sink, control_rx, outbox_rx));
    let mut read_task = tokio::spawn(read_loop(stream, id, registry.clone(), control_tx.clone()));

    let (reason, writer_done) = if *shutdown.borrow_and_update() {
        (CloseReason::Shutdown, false)
    } else {
        wait_for_end(&mut read_task, &mut write_task, &mut shutdown).await
    };
    read_task.abort();

    if let CloseReason::Transport(detail) = &reason {
        debug!(connection_id = %id, "Transport error: {detail}");
    }
    if let Some(frame) = close_frame_for(&reason) {
        let _ = control_tx.try_send(frame);
    }
    drop(control_tx);

    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut write_task).await.is_err() {
        warn!(connection_id = %id, "Writer did not finish in time, aborting");
        write_task.abort();
    }

    let left = registry.leave(id);
    info!(connection_id = %id, channels = left, reason = ?reason, "Realtime client disconnected");
}

/// Waits for the reader, the writer or shutdown. The flag reports whether
/// the writer has already finished.
async fn wait_for_end(
    read_task: &mut JoinHandle<CloseReason>,
    write_task: &mut JoinHandle<Result<(), ChannelError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> (CloseReason, bool) {
    tokio::select! {
        read = read_task => {
            let reason = read.unwrap_or_else(|e| CloseReason::Transport(e.to_string()));
            (reason, false)
        }
        written = write_task => {
            let reason = match written {
                Ok(Ok(())) => CloseReason::ClientClosed,
                Ok(Err(e)) => CloseReason::Transport(e.to_string()),
                Err(e) => CloseReason::Transport(e.to_string()),
            };
            (reason, true)
        }
        _ = shutdown.changed() => (CloseReason::Shutdown, false),
    }
}

/// Client -> server: joins and pings until the peer closes or misbehaves.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    id: ConnectionId,
    registry: Arc<ChannelRegistry>,
    control: mpsc::Sender<Message>,
) -> CloseReason {
    while let Some(inbound) = stream.next().await {
        let text = match inbound {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return CloseReason::ClientClosed,
            Ok(_) => continue,
            Err(e) => return CloseReason::Transport(e.to_string()),
        };
        let reply = match parse_frame(text.as_str()) {
            Ok(Inbound::Join(channel)) => {
                registry.join(channel.clone(), id);
                WsMessage::Joined { device_id: channel }
            }
            Ok(Inbound::Ping) => WsMessage::Pong,
            Ok(Inbound::Ignore) => {
                debug!(connection_id = %id, "Ignoring WS message");
                continue;
            }
            Err(e) => {
                warn!(connection_id = %id, "Invalid WS message: {e}");
                return CloseReason::Malformed(e.to_string());
            }
        };
        let Some(frame) = encode(&reply) else {
            continue;
        };
        if control.send(frame).await.is_err() {
            return CloseReason::Transport("writer stopped".to_string());
        }
    }
    CloseReason::ClientClosed
}

/// Server -> client: replies first, then fan-out events. Stops after a
/// close frame or when every sender is gone.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut control: mpsc::Receiver<Message>,
    mut outbox: mpsc::Receiver<Arc<PublishedEvent>>,
) -> Result<(), ChannelError> {
    loop {
        let frame = tokio::select! {
            biased;
            queued = control.recv() => match queued {
                Some(frame) => frame,
                None => return Ok(()),
            },
            Some(event) = outbox.recv() => {
                match encode(&WsMessage::from(PublishedEvent::clone(&event))) {
                    Some(frame) => frame,
                    None => continue,
                }
            }
        };
        let closing = matches!(frame, Message::Close(_));
        sink.send(frame)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        if closing {
            return Ok(());
        }
    }
}

// ─── Helpers ───────────────────────────────────────────────

/// Classifies one inbound text frame.
fn parse_frame(text: &str) -> Result<Inbound, ChannelError> {
    let msg = serde_json::from_str::<WsMessage>(text)
        .map_err(|e| ChannelError::Malformed(e.to_string()))?;
    match msg {
        WsMessage::JoinDevice { device_id } if device_id.is_empty() => Err(
            ChannelError::Malformed("device_id must be a non-empty string".into()),
        ),
        WsMessage::JoinDevice { device_id } => Ok(Inbound::Join(device_id)),
        WsMessage::Ping => Ok(Inbound::Ping),
        _ => Ok(Inbound::Ignore),
    }
}

/// Serializes an outbound envelope into a text frame.
fn encode(msg: &WsMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode WS message: {e}");
            None
        }
    }
}

/// Close frame owed to the peer for `reason`, if any.
fn close_frame_for(reason: &CloseReason) -> Option<Message> {
    match reason {
        CloseReason::Malformed(detail) => Some(close_message(close_code::POLICY, detail)),
        CloseReason::Shutdown => Some(close_message(close_code::AWAY, "server shutting down")),
        CloseReason::ClientClosed | CloseReason::Transport(_) => None,
    }
}

/// Close frame with the reason truncated to fit the protocol limit.
fn close_message(code: ws::CloseCode, reason: &str) -> Message {
    // Close reasons are capped at 123 bytes by the protocol.
    let mut end = reason.len().min(120);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].into(),
    }))
}

// ─── Tests ─────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_accepts_join() {
        let parsed = parse_frame(r#"{"type":"join_device","device_id":"device-42"}"#);
        assert_eq!(parsed.expect("join"), Inbound::Join(ChannelId::from("device-42")));
    }

    #[test]
    fn parse_frame_accepts_arbitrary_identifiers() {
        let parsed = parse_frame(r#"{"type":"join_device","device_id":"no such device ✓"}"#);
        assert!(matches!(parsed, Ok(Inbound::Join(_))));
    }

    #[test]
    fn parse_frame_rejects_empty_identifier() {
        let err = parse_frame(r#"{"type":"join_device","device_id":""}"#).expect_err("empty id");
        assert!(matches!(err, ChannelError::Malformed(_)));
    }

    #[test]
    fn parse_frame_rejects_non_string_identifier_and_garbage() {
        assert!(parse_frame(r#"{"type":"join_device","device_id":42}"#).is_err());
        assert!(parse_frame("{not json").is_err());
        assert!(parse_frame(r#"{"device_id":"x"}"#).is_err());
    }

    #[test]
    fn parse_frame_handles_ping_and_unknown_types() {
        assert_eq!(parse_frame(r#"{"type":"ping"}"#).expect("ping"), Inbound::Ping);
        assert_eq!(
            parse_frame(r#"{"type":"typing"}"#).expect("unknown"),
            Inbound::Ignore
        );
        assert_eq!(
            parse_frame(r#"{"type":"pong"}"#).expect("pong"),
            Inbound::Ignore
        );
    }

    #[test]
    fn close_message_truncates_long_reasons_on_char_boundary() {
        let long = "é".repeat(100);
        let Message::Close(Some(frame)) = close_message(close_code::POLICY, &long) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, close_code::POLICY);
        assert!(frame.reason.as_str().len() <= 120);
    }

    #[test]
    fn close_frames_only_for_policy_and_shutdown() {
        let Some(Message::Close(Some(frame))) =
            close_frame_for(&CloseReason::Malformed("bad".into()))
        else {
            panic!("expected policy close");
        };
        assert_eq!(frame.code, close_code::POLICY);

        let Some(Message::Close(Some(frame))) = close_frame_for(&CloseReason::Shutdown) else {
            panic!("expected away close");
        };
        assert_eq!(frame.code, close_code::AWAY);

        assert!(close_frame_for(&CloseReason::ClientClosed).is_none());
        assert!(close_frame_for(&CloseReason::Transport("reset".into())).is_none());
    }
}
