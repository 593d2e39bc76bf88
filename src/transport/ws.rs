//! WebSocket transport speaking JSON text frames.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SpeechConfig;

use super::{SpeechRequest, SpeechResponse, Transport, TransportError};

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type Inbound = mpsc::Receiver<Result<SpeechResponse, TransportError>>;

/// Framed JSON-over-WebSocket connection to the speech service.
///
/// `open` connects and spawns a pump task that owns the socket; `send`
/// queues frames to it, `recv` drains decoded responses from it. The pump
/// forwards exactly one [`TransportError::Broken`] when the socket dies,
/// then ends the inbound channel so later `recv` calls see `Closed`.
pub struct WsTransport {
    endpoint: String,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    inbound: AsyncMutex<Option<Inbound>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Build a transport from engine configuration: `host`, `port` and
    /// `branch` form the endpoint, device credentials ride as query
    /// parameters.
    pub fn from_config(config: &SpeechConfig) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: Self::build_endpoint(config)?,
            outbound: Mutex::new(None),
            inbound: AsyncMutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    fn build_endpoint(config: &SpeechConfig) -> Result<String, TransportError> {
        let host = config.get("host", "localhost");
        let port = config.get("port", "443");
        let mut url = Url::parse(&format!("wss://{host}:{port}")).map_err(|e| {
            error!(error = %e, "invalid speech endpoint");
            TransportError::NotAvailable
        })?;
        url.set_path(config.get("branch", "/"));
        let credentials: Vec<(&str, &str)> = ["key", "device_type_id", "device_id"]
            .into_iter()
            .map(|key| (key, config.get(key, "")))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        if !credentials.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in credentials {
                query.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.outbound.lock().is_some() {
            return Ok(());
        }

        let (ws, _) = connect_async(self.endpoint.as_str()).await.map_err(|e| {
            warn!(error = %e, "failed to connect to speech service");
            TransportError::NotAvailable
        })?;
        info!("connected to speech service");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                error!(error = %e, "websocket send failed");
                                let _ = in_tx.send(Err(TransportError::Broken)).await;
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SpeechResponse>(&text) {
                                Ok(resp) => {
                                    if in_tx.send(Ok(resp)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "malformed frame dropped"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server closed the connection");
                            let _ = in_tx.send(Err(TransportError::Broken)).await;
                            break;
                        }
                        // Ping/pong are answered by the library.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "websocket receive failed");
                            let _ = in_tx.send(Err(TransportError::Broken)).await;
                            break;
                        }
                        None => {
                            let _ = in_tx.send(Err(TransportError::Broken)).await;
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("transport pump quit");
        });

        *self.outbound.lock() = Some(out_tx);
        *self.inbound.lock().await = Some(in_rx);
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn send(
        &self,
        req: &SpeechRequest,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let tx = match self.outbound.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(TransportError::NotAvailable),
        };
        let text =
            serde_json::to_string(req).map_err(|_| TransportError::Unknown)?;
        match tokio::time::timeout(timeout, tx.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Broken),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<SpeechResponse, TransportError> {
        let mut guard = self.inbound.lock().await;
        let rx = match guard.as_mut() {
            Some(rx) => rx,
            None => return Err(TransportError::Closed),
        };
        let next = match timeout {
            Some(t) => match tokio::time::timeout(t, rx.recv()).await {
                Ok(next) => next,
                Err(_) => return Err(TransportError::Timeout),
            },
            None => rx.recv().await,
        };
        match next {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        // Dropping the outbound sender and signalling shutdown ends the
        // pump, which drops its inbound sender and thereby unblocks any
        // receiver waiting in `recv`.
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        *self.outbound.lock() = None;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(CLOSE_GRACE, task).await;
        }
        *self.inbound.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_credentials() {
        let mut config = SpeechConfig::new();
        config.set("host", "speech.example.com");
        config.set("port", "443");
        config.set("branch", "/api");
        config.set("key", "k-123");
        config.set("device_id", "dev-9");

        let endpoint = WsTransport::build_endpoint(&config).unwrap();
        assert!(endpoint.starts_with("wss://speech.example.com/api?"));
        assert!(endpoint.contains("key=k-123"));
        assert!(endpoint.contains("device_id=dev-9"));
        assert!(!endpoint.contains("device_type_id"));
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = WsTransport::build_endpoint(&SpeechConfig::new()).unwrap();
        assert_eq!(endpoint, "wss://localhost/");
    }

    #[test]
    fn test_endpoint_keeps_non_default_port() {
        let mut config = SpeechConfig::new();
        config.set("host", "10.0.0.2");
        config.set("port", "8443");

        let endpoint = WsTransport::build_endpoint(&config).unwrap();
        assert_eq!(endpoint, "wss://10.0.0.2:8443/");
    }
}
