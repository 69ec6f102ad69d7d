use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Image lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEvent {
    /// Event key (e.g., "image.pull", "image.remove")
    pub key: String,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ImageEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event carrying an image ID and an optional name
    pub fn for_image(key: impl Into<String>, id: &str, name: Option<&str>) -> Self {
        let mut map = HashMap::new();
        map.insert("id".to_string(), serde_json::Value::from(id));
        if let Some(name) = name {
            map.insert("name".to_string(), serde_json::Value::from(name));
        }
        Self::new(key, EventPayload::Map(map))
    }

    /// Image ID carried by the payload, if any
    pub fn image_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Map(map) => map.get("id").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<ImageEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped when nobody is subscribed
    pub fn emit(&self, event: ImageEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.sender.subscribe()
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const IMAGE_PULL: &str = "image.pull";
    pub const IMAGE_PUSH: &str = "image.push";
    pub const IMAGE_REMOVE: &str = "image.remove";
    pub const IMAGE_TAG: &str = "image.tag";
    pub const IMAGE_UNTAG: &str = "image.untag";
}
