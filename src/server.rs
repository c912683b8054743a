//! WebSocket transport in front of [`SignalingHub`].
//!
//! One task per connection reads client frames and feeds the hub; a second
//! task drains the connection's outbox into the socket, so everything the
//! hub sends to one connection leaves in order. Closing the socket is the
//! only way to leave a room.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::hub::SignalingHub;
use crate::signaling::ClientMessage;

/// Pause after a failed accept, e.g. while the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SignalingServer {
    listener: TcpListener,
    hub: Arc<SignalingHub>,
}

impl SignalingServer {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            listener,
            hub: Arc::new(SignalingHub::new(config)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<SignalingHub> {
        self.hub.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Signaling server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = accept_next(|| self.listener.accept()) => accepted,
                _ = &mut shutdown => {
                    info!("Signaling server shutting down");
                    return Ok(());
                }
            };
            debug!("New TCP connection from {}", addr);

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Retries `accept` until it yields a connection. Accept errors concern a
/// single pending connection and never stop the server.
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<SignalingHub>,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (id, mut outbox) = hub.connect();
    info!(peer = %id, "WebSocket connection established from {}", addr);

    // Ends once the hub unregisters this connection and drops the outbox sender.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => hub.handle(&id, msg),
                Err(e) => hub.reply_error(&id, &Error::Json(e)),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %id, "WebSocket read failed: {}", e);
                break;
            }
        }
    }

    hub.disconnect(&id);
    info!(peer = %id, "WebSocket connection closed");
    let _ = writer.await;
    Ok(())
}
