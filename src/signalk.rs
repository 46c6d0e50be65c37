//! Signal K websocket stream client.
//!
//! Connects to `/signalk/v1/stream`, forwards every text frame to the
//! pipeline over an mpsc channel and reconnects forever with exponential
//! backoff. The server's hello frame is forwarded too; it carries no
//! `updates` and the pipeline ignores it.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn the stream task. It ends only when `tx` is closed.
pub fn spawn(url: String, tx: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shown = redact(&url);
        let mut delay = INITIAL_BACKOFF;

        loop {
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    tracing::info!("Signal K stream connected: {}", shown);
                    delay = INITIAL_BACKOFF;

                    while let Some(frame) = ws.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                if tx.send(text).await.is_err() {
                                    tracing::debug!("Pipeline gone, closing Signal K stream");
                                    return;
                                }
                            }
                            Ok(Message::Close(reason)) => {
                                tracing::warn!("Signal K stream closed by server: {:?}", reason);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("Signal K stream error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Signal K connect to {} failed: {}", shown, e);
                }
            }

            if tx.is_closed() {
                return;
            }
            tracing::info!("Reconnecting to Signal K in {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = next_backoff(delay);
        }
    })
}

pub fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

/// Stream URL with any access token masked, for logs.
pub fn redact(url: &str) -> String {
    match url.find("token=") {
        Some(at) => {
            let start = at + "token=".len();
            let end = url[start..].find('&').map_or(url.len(), |i| start + i);
            format!("{}***{}", &url[..start], &url[end..])
        }
        None => url.to_string(),
    }
}
