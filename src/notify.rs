use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource fan-out of committed events. Backs `LISTEN resource_<id>`
/// and in-process subscribers such as open booking screens.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel of a deleted resource. Open receivers see it closed.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

/// `LISTEN` channel name for a resource.
pub fn channel_name(resource_id: Ulid) -> String {
    format!("resource_{resource_id}")
}

/// Inverse of [`channel_name`].
pub fn parse_channel(name: &str) -> Option<Ulid> {
    let id = name.trim_matches('"').strip_prefix("resource_")?;
    Ulid::from_string(id).ok()
}

/// JSON payload carried by a wire notification.
pub fn event_payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".into())
}
