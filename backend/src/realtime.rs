use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::metrics::{EVENTS_PUBLISHED_TOTAL, SOCKET_SUBSCRIBERS};
use crate::model::{Alert, Device, TelemetryReading};

/// Change notifications pushed to dashboard subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Telemetry(TelemetryReading),
    Alert(Alert),
    AlertAck(Alert),
    DeviceCreated(Device),
    DeviceUpdated(Device),
    DeviceDeleted { id: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Telemetry(_) => "telemetry",
            Event::Alert(_) => "alert",
            Event::AlertAck(_) => "alert:ack",
            Event::DeviceCreated(_) => "device:created",
            Event::DeviceUpdated(_) => "device:update",
            Event::DeviceDeleted { .. } => "device:deleted",
        }
    }

    fn data(&self) -> serde_json::Result<Value> {
        match self {
            Event::Telemetry(reading) => serde_json::to_value(reading),
            Event::Alert(alert) | Event::AlertAck(alert) => serde_json::to_value(alert),
            Event::DeviceCreated(device) | Event::DeviceUpdated(device) => {
                serde_json::to_value(device)
            }
            Event::DeviceDeleted { id } => Ok(json!({ "id": id })),
        }
    }

    /// Wire frame: `{"event": <name>, "data": <payload>}`.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Frame<'a> {
            event: &'a str,
            data: Value,
        }

        serde_json::to_string(&Frame {
            event: self.name(),
            data: self.data()?,
        })
    }
}

/// Fire-and-forget event sink. Implementations must never block the caller.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Fans frames out to every connected socket through a broadcast channel.
/// Delivery is at-most-once: late subscribers miss earlier frames and
/// lagging ones skip what they fell behind on.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Arc<str>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Publisher for Broadcaster {
    fn publish(&self, event: Event) {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[event.name()])
            .inc();

        // An error only means nobody is listening right now.
        if self.tx.send(Arc::from(frame)).is_err() {
            debug!("No subscribers for {} event", event.name());
        }
    }
}

/// Keeps every published event in memory.
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Messages a dashboard may send. Rooms are accepted but broadcast stays global.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum ClientMessage {
    Join { room: String },
}

pub async fn socket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, rx))
}

/// Next frame for one subscriber. Frames lost to lag are skipped; `None` once the channel closes.
async fn next_frame(rx: &mut broadcast::Receiver<Arc<str>>) -> Option<Arc<str>> {
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Socket subscriber lagged, dropped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn serve_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<Arc<str>>) {
    SOCKET_SUBSCRIBERS.inc();
    info!("Socket connected");

    loop {
        tokio::select! {
            frame = next_frame(&mut rx) => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Join { room }) => debug!("Socket joined room {}", room),
                            Err(_) => debug!("Ignoring socket message: {}", text),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    SOCKET_SUBSCRIBERS.dec();
    info!("Socket disconnected");
}
