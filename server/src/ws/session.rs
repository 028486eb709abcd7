use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::ws::hub::{HubHandle, SessionId};
use crate::ws::protocol::{Envelope, InboundFrame};

/// One connected participant: its identity plus the receiving end of its
/// outbound queue. The Hub holds the only sender.
pub struct Session {
    id: SessionId,
    username: String,
    queue: mpsc::Receiver<Arc<Envelope>>,
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer sent a close frame.
    ClientClosed,
    /// Transport stream ended without a close frame.
    StreamEnded,
    ReadFailed,
    /// No pong arrived before the read deadline.
    PongTimeout,
    /// The Hub closed this session's queue (unregister or eviction).
    QueueClosed,
    WriteFailed,
    WriteTimedOut,
    HubUnavailable,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        username: String,
        queue: mpsc::Receiver<Arc<Envelope>>,
    ) -> Self {
        Self {
            id,
            username,
            queue,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Next queued envelope, or `None` once the Hub has closed the queue.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.queue.recv().await
    }
}

/// Register with the Hub and run both pumps for an upgraded WebSocket until
/// either side disconnects.
pub async fn run_connection(
    socket: WebSocket,
    hub: HubHandle,
    username: String,
    config: SessionConfig,
) {
    let (writer, reader) = socket.split();
    accept(reader, writer, hub, username, config).await;
}

/// Register `username` and serve it over the given transport halves. If the
/// Hub is gone, the peer gets an `error` envelope and a going-away close.
pub async fn accept<R, W, E>(
    reader: R,
    mut writer: W,
    hub: HubHandle,
    username: String,
    config: SessionConfig,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send,
{
    let session = match hub.register(username.clone()).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(username = %username, error = %e, "Registration failed");
            let limit = config.write_timeout();
            if let Ok(text) = Envelope::error(None, &username, "Server unavailable").encode() {
                let _ = write(&mut writer, Message::Text(text.into()), limit).await;
            }
            let close = Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "Server unavailable".into(),
            }));
            let _ = write(&mut writer, close, limit).await;
            return;
        }
    };

    serve(session, reader, writer, hub, config).await;
}

/// Drive a registered session over any frame transport.
///
/// The outbound pump runs on its own task; the inbound pump runs here. When
/// either stops, the session is unregistered, which closes the queue and lets
/// the outbound pump send its close frame.
pub async fn serve<R, W, E>(
    session: Session,
    reader: R,
    writer: W,
    hub: HubHandle,
    config: SessionConfig,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send,
{
    let Session {
        id,
        username,
        queue,
    } = session;

    tracing::info!(member_id = %id, username = %username, "Session started");

    let mut writer_task = tokio::spawn(outbound_pump(
        writer,
        queue,
        id,
        config.ping_interval(),
        config.write_timeout(),
    ));

    let (reason, writer_done) = tokio::select! {
        reason = inbound_pump(reader, &hub, id, &username, config.pong_timeout()) => {
            (reason, false)
        }
        joined = &mut writer_task => (joined.unwrap_or(Disconnect::WriteFailed), true),
    };

    if let Err(e) = hub.unregister(id).await {
        tracing::debug!(member_id = %id, error = %e, "Unregister skipped");
    }

    if !writer_done {
        match timeout(config.write_timeout(), &mut writer_task).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(member_id = %id, "Outbound pump stalled, aborting");
                writer_task.abort();
            }
        }
    }

    tracing::info!(
        member_id = %id,
        username = %username,
        reason = ?reason,
        "Session stopped"
    );
}

/// Read frames, stamp them with the session identity and forward them to the
/// Hub. The read deadline only moves when a pong arrives.
async fn inbound_pump<R, E>(
    mut reader: R,
    hub: &HubHandle,
    id: SessionId,
    username: &str,
    pong_timeout: Duration,
) -> Disconnect
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let member_id = id.to_string();
    let mut deadline = Instant::now() + pong_timeout;

    loop {
        let msg = match timeout_at(deadline, reader.next()).await {
            Err(_) => {
                tracing::warn!(member_id = %id, "Pong timeout, dropping connection");
                return Disconnect::PongTimeout;
            }
            Ok(None) => return Disconnect::StreamEnded,
            Ok(Some(Err(e))) => {
                tracing::warn!(member_id = %id, error = %e, "WebSocket receive error");
                return Disconnect::ReadFailed;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let frame = match msg {
            Message::Text(text) => InboundFrame::decode(text.as_str()),
            Message::Binary(data) => InboundFrame::decode_bytes(&data),
            Message::Pong(_) => {
                deadline = Instant::now() + pong_timeout;
                continue;
            }
            // The transport answers pings on its own.
            Message::Ping(_) => continue,
            Message::Close(frame) => {
                tracing::debug!(member_id = %id, frame = ?frame, "Client initiated close");
                return Disconnect::ClientClosed;
            }
        };

        match frame {
            Ok(frame) => {
                let envelope = frame.into_chat(&member_id, username);
                tracing::debug!(member_id = %id, "Chat frame received");
                if hub.broadcast(envelope).await.is_err() {
                    return Disconnect::HubUnavailable;
                }
            }
            Err(e) => {
                tracing::warn!(member_id = %id, error = %e, "Dropping undecodable frame");
            }
        }
    }
}

/// Drain the queue onto the transport and send periodic pings.
async fn outbound_pump<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Arc<Envelope>>,
    id: SessionId,
    ping_interval: Duration,
    write_timeout: Duration,
) -> Disconnect
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(envelope) = next else {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    let _ = write(&mut writer, close, write_timeout).await;
                    return Disconnect::QueueClosed;
                };
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(
                            member_id = %id,
                            error = %e,
                            "Dropping unencodable envelope"
                        );
                        continue;
                    }
                };
                let frame = Message::Text(text.into());
                if let Err(reason) = write(&mut writer, frame, write_timeout).await {
                    tracing::warn!(member_id = %id, reason = ?reason, "Write failed");
                    return reason;
                }
            }
            _ = ticker.tick() => {
                let ping = Message::Ping(Default::default());
                if let Err(reason) = write(&mut writer, ping, write_timeout).await {
                    tracing::debug!(member_id = %id, reason = ?reason, "Ping failed");
                    return reason;
                }
            }
        }
    }
}

async fn write<W>(writer: &mut W, msg: Message, limit: Duration) -> Result<(), Disconnect>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(limit, writer.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket send error");
            Err(Disconnect::WriteFailed)
        }
        Err(_) => Err(Disconnect::WriteTimedOut),
    }
}
