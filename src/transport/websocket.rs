//! WebSocket transport
//!
//! Accepts TCP connections, upgrades them to WebSocket and runs one worker
//! task per connection:
//! - a writer task drains the connection's `Channel` sink into the socket
//! - the reader decodes frames in receipt order and hands them to the
//!   `BrokerEngine`, then dispatches the resulting `Response`
//! - the first frame must be CONNECT within the configured connect timeout;
//!   afterwards the connection is dropped after 1.5x keep-alive of silence
//!
//! However the reader stops (client DISCONNECT, socket closure, timeout or a
//! fatal protocol error) a still-connected channel goes through the engine's
//! ordinary `disconnect` so clean sessions are discarded exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::BrokerEngine;
use crate::broker::message::{DisconnectMessage, OutboundPacket};
use crate::channel::{Channel, ConnectionStatus};
use crate::config::Settings;
use crate::persistence::SubscriptionStore;
use crate::transport::message::{decode_message, encode_frame};
use crate::utils::Result;

/// Binds the listener described by `settings` and serves it until the
/// listener fails.
pub async fn start_websocket_server(
    settings: Settings,
    engine: Arc<BrokerEngine>,
    store: Arc<dyn SubscriptionStore>,
) -> Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    let connect_timeout = Duration::from_secs(settings.server.connect_timeout_secs);
    serve(listener, engine, store, connect_timeout).await
}

/// Accept loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<BrokerEngine>,
    store: Arc<dyn SubscriptionStore>,
    connect_timeout: Duration,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        let store = store.clone();

        spawn(async move {
            if let Err(e) = handle_connection(stream, peer, engine, store, connect_timeout).await {
                warn!("Connection from {peer} closed with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<BrokerEngine>,
    store: Arc<dyn SubscriptionStore>,
    connect_timeout: Duration,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundPacket>();
    let channel = Channel::new(tx);
    let connection_id = channel.connection_id();
    debug!("Accepted connection {connection_id} from {peer}");

    let writer = spawn(async move {
        while let Some(packet) = rx.recv().await {
            let frame = match encode_frame(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode packet for {connection_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(frame).await {
                warn!("Failed to send to {connection_id}: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send loop closed for {connection_id}");
    });

    let result = read_loop(
        &mut ws_receiver,
        &engine,
        store.as_ref(),
        &channel,
        connect_timeout,
    )
    .await;

    if channel.is_connected() {
        if let Err(e) = engine.disconnect(DisconnectMessage, &channel, store.as_ref()) {
            error!("Failed to tear down session of {}: {e}", channel.client_id());
        }
    }

    // Dropping the last strong reference closes the sink; the writer flushes
    // what is queued (e.g. a refusing CONNACK) and exits.
    drop(channel);
    if let Err(e) = writer.await {
        error!("Writer task for {connection_id} failed: {e}");
    }
    result
}

/// How long the reader waits for the next frame, if at all.
fn idle_limit(channel: &Channel, connect_timeout: Duration) -> Option<Duration> {
    match channel.status() {
        ConnectionStatus::Connecting => Some(connect_timeout),
        _ => match channel.keep_alive() {
            0 => None,
            secs => Some(Duration::from_millis(u64::from(secs) * 1500)),
        },
    }
}

async fn read_loop<S>(
    receiver: &mut S,
    engine: &BrokerEngine,
    store: &dyn SubscriptionStore,
    channel: &Arc<Channel>,
    connect_timeout: Duration,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        let next = match idle_limit(channel, connect_timeout) {
            Some(limit) => match timeout(limit, receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(
                        "Connection {} idle for {:?}, closing",
                        channel.connection_id(),
                        limit
                    );
                    return Ok(());
                }
            },
            None => receiver.next().await,
        };

        let message = match next {
            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.into()),
        };
        let Some(packet) = decode_message(&message)? else {
            continue;
        };

        let kind = packet.kind();
        debug!("{kind} from {}", channel.connection_id());
        match engine.handle(packet, channel, store) {
            Ok(response) => {
                response.dispatch(channel)?;
                if response.close {
                    return Ok(());
                }
            }
            Err(e) if !e.is_fatal() => {
                warn!("Ignoring {kind} from {}: {e}", channel.client_id());
            }
            Err(e) => return Err(e),
        }
    }
}
