//! WebSocket channel for live run progress.
//!
//! Clients send `{"type": "subscribe", "run_id": "..."}` to follow a run and
//! `{"type": "unsubscribe"}` to stop. A socket follows at most one run; a new
//! subscribe replaces the previous one. Events are the JSON form of
//! [`ProgressEvent`](healer::progress::ProgressEvent).

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::AppState;

/// Outgoing frames buffered per socket.
const OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { run_id: String },
    Unsubscribe,
}

/// GET /ws - upgrade to a progress socket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

/// Forwarder for the socket's current subscription.
struct Active {
    run_id: String,
    observer: u64,
    task: JoinHandle<()>,
}

impl Active {
    fn stop(self, app: &AppState) {
        self.task.abort();
        app.hub.unsubscribe(&self.run_id, self.observer);
        debug!(run_id = %self.run_id, observer = self.observer, "unsubscribed");
    }
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut active: Option<Active> = None;
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Subscribe { run_id }) => {
                if let Some(previous) = active.take() {
                    previous.stop(&app);
                }
                active = Some(subscribe(&app, run_id, out_tx.clone()));
            }
            Ok(ClientMessage::Unsubscribe) => {
                if let Some(previous) = active.take() {
                    previous.stop(&app);
                }
            }
            Err(err) => {
                debug!(err = %err, "ignoring malformed client message");
            }
        }
    }

    if let Some(previous) = active.take() {
        previous.stop(&app);
    }
    writer.abort();
}

fn subscribe(app: &AppState, run_id: String, out_tx: mpsc::Sender<String>) -> Active {
    let mut subscription = app.hub.subscribe(&run_id);
    let observer = subscription.id;
    info!(run_id = %run_id, observer, "socket subscribed");
    let task = tokio::spawn(async move {
        while let Some(event) = subscription.events.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if out_tx.send(json).await.is_err() {
                break;
            }
        }
    });
    Active {
        run_id,
        observer,
        task,
    }
}

#[cfg(test)]
mod tests {
    use healer::core::types::{HealNode, RunState};
    use healer::io::config::HealerConfig;
    use healer::progress::ProgressEvent;

    use super::*;

    #[test]
    fn parses_client_messages() {
        let subscribe: ClientMessage =
            serde_json::from_str(r#"{"type": "subscribe", "run_id": "run_1"}"#).expect("parse");
        assert_eq!(
            subscribe,
            ClientMessage::Subscribe {
                run_id: "run_1".to_string()
            }
        );
        let unsubscribe: ClientMessage =
            serde_json::from_str(r#"{"type": "unsubscribe"}"#).expect("parse");
        assert_eq!(unsubscribe, ClientMessage::Unsubscribe);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "ping"}"#).is_err());
    }

    #[tokio::test]
    async fn forwarder_relays_events_and_stop_detaches() {
        let app = AppState::new(HealerConfig::default());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let active = subscribe(&app, "run_1".to_string(), out_tx);
        assert_eq!(app.hub.observer_count("run_1"), 1);

        let state = RunState::new("run_1", "https://github.com/o/r", 3);
        app.hub.publish(&ProgressEvent::update(HealNode::Clone, &state));
        let frame = out_rx.recv().await.expect("frame");
        let json: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(json["type"], "pipeline_update");
        assert_eq!(json["run_id"], "run_1");
        assert_eq!(json["progress"], 5);

        active.stop(&app);
        assert_eq!(app.hub.observer_count("run_1"), 0);
    }
}
