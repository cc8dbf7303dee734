use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tokio_util::sync::CancellationToken;

use super::frames::{AgentFrame, CoordinatorFrame};

const FRAME_BUFFER: usize = 64;

/// Both directions of one established coordinator session.
#[derive(Debug)]
pub struct FramePipe {
    pub tx: mpsc::Sender<AgentFrame>,
    pub rx: mpsc::Receiver<CoordinatorFrame>,
}

/// Establishes sessions. The session ends when `rx` yields `None`.
#[tonic::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> anyhow::Result<FramePipe>;
}

/// WebSocket dialer with optional bearer-token auth.
#[derive(Debug, Clone, Default)]
pub struct WsDialer {
    token: Option<String>,
}

impl WsDialer {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[tonic::async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> anyhow::Result<FramePipe> {
        let mut req = url.into_client_request()?;
        if let Some(tok) = &self.token {
            let value = format!("Bearer {tok}");
            req.headers_mut().insert("Authorization", value.parse()?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<AgentFrame>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<CoordinatorFrame>(FRAME_BUFFER);
        let done = CancellationToken::new();

        tokio::spawn({
            let done = done.clone();
            async move {
                while let Some(frame) = out_rx.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(WsMessage::Close(None)).await;
                done.cancel();
            }
        });

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = done.cancelled() => break,
                    msg = stream.next() => msg,
                };
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    WsMessage::Text(text) => {
                        let frame = serde_json::from_str::<CoordinatorFrame>(&text)
                            .unwrap_or(CoordinatorFrame::Unknown);
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            done.cancel();
        });

        Ok(FramePipe {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
