//! DevTools protocol transport over one WebSocket.

use crate::base::error::AuditError;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

type PendingTx = oneshot::Sender<Result<Value, String>>;

/// Reply slots by command id, shared by callers and the handler task.
#[derive(Default)]
struct Pending {
    slots: Mutex<HashMap<u64, PendingTx>>,
}

impl Pending {
    fn insert(&self, id: u64, tx: PendingTx) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(id, tx);
        }
    }

    fn remove(&self, id: u64) -> Option<PendingTx> {
        self.slots.lock().ok().and_then(|mut slots| slots.remove(&id))
    }

    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Drop every slot; waiting callers see the connection as closed.
    fn clear(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.clear();
        }
    }
}

/// A protocol event (a message with `method` and no `id`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

struct CdpCommand {
    id: u64,
    method: String,
    params: Value,
}

/// Commands go out through a handler task that correlates replies by id;
/// events are fanned out to every subscriber.
pub struct CdpConnection {
    cmd_tx: mpsc::Sender<CdpCommand>,
    events: broadcast::Sender<CdpEvent>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    command_timeout: Duration,
    handler: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self, AuditError> {
        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|e| AuditError::Cdp(format!("WebSocket connect to {ws_url}: {e}")))?;
        Ok(Self::from_stream(ws, command_timeout))
    }

    /// Run the protocol over an already-open WebSocket.
    pub fn from_stream<S>(ws: S, command_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let (events, _) = broadcast::channel(256);
        let pending = Arc::new(Pending::default());
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, events.clone(), pending.clone()));
        Self {
            cmd_tx,
            events,
            pending,
            next_id: AtomicU64::new(1),
            command_timeout,
            handler,
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Commands still waiting for a reply.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Send one command and wait for its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, AuditError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let command = CdpCommand {
            id,
            method: method.to_string(),
            params,
        };
        if self.cmd_tx.send(command).await.is_err() {
            self.pending.remove(id);
            return Err(AuditError::CdpClosed);
        }

        let reply = match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(reply) => reply,
            Err(_) => {
                self.pending.remove(id);
                return Err(AuditError::CdpTimeout {
                    method: method.to_string(),
                    timeout_ms: self.command_timeout.as_millis() as u64,
                });
            }
        };
        let result = reply.map_err(|_| AuditError::CdpClosed)?;
        result.map_err(|message| AuditError::Cdp(format!("{method}: {message}")))
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl std::fmt::Debug for CdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpConnection")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_commands())
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

async fn handler_loop<S>(
    ws: S,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    events: broadcast::Sender<CdpEvent>,
    pending: Arc<Pending>,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let msg = json!({
                    "id": cmd.id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                if ws_tx.send(Message::Text(msg.to_string())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val) = serde_json::from_str::<Value>(&text) else {
                    tracing::trace!("non-JSON DevTools frame");
                    continue;
                };
                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.remove(id) {
                        let reply = match val.get("error") {
                            Some(err) => Err(err["message"].as_str().unwrap_or("CDP error").to_string()),
                            None => Ok(val["result"].clone()),
                        };
                        let _ = tx.send(reply);
                    }
                } else if let Some(method) = val.get("method").and_then(Value::as_str) {
                    let _ = events.send(CdpEvent {
                        method: method.to_string(),
                        params: val["params"].clone(),
                    });
                }
            }
        }
    }
    tracing::debug!(pending = pending.len(), "DevTools connection closed");
    cmd_rx.close();
    pending.clear();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// A WebSocket endpoint that answers every command through `reply` and
    /// emits `Page.loadEventFired` after `Page.navigate`.
    pub(crate) async fn fake_devtools<F>(reply: F) -> String
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                let method = req["method"].as_str().unwrap_or_default().to_string();
                let body = match reply(&method, &req["params"]) {
                    Ok(result) => json!({ "id": req["id"], "result": result }),
                    Err(message) => json!({ "id": req["id"], "error": { "message": message } }),
                };
                ws.send(Message::Text(body.to_string())).await.unwrap();
                if method == "Page.navigate" || method == "Page.reload" {
                    let event = json!({ "method": "Page.loadEventFired", "params": { "timestamp": 1.0 } });
                    ws.send(Message::Text(event.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_replies_correlated_by_id() {
        let url = fake_devtools(|method, params| match method {
            "Echo" => Ok(params.clone()),
            _ => Err(format!("'{method}' wasn't found")),
        })
        .await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(5)).await.unwrap();

        let echoed = conn.send("Echo", json!({ "n": 7 })).await.unwrap();
        assert_eq!(echoed["n"], 7);

        let err = conn.send("Nope", json!({})).await.unwrap_err();
        assert!(matches!(err, AuditError::Cdp(ref m) if m.contains("wasn't found")));
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let url = fake_devtools(|_, _| Ok(json!({ "frameId": "F" }))).await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(5)).await.unwrap();
        let mut events = conn.subscribe();

        conn.send("Page.navigate", json!({ "url": "about:blank" })).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let conn = CdpConnection::connect(&format!("ws://{addr}"), Duration::from_millis(100))
            .await
            .unwrap();
        let err = conn.send("Page.enable", json!({})).await.unwrap_err();
        assert!(matches!(err, AuditError::CdpTimeout { .. }));
        // The abandoned reply slot is released.
        assert_eq!(conn.pending_commands(), 0);
    }
}
