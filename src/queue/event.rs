//! Notifications produced by the request queue

use serde::{Deserialize, Serialize};

/// Message pushed toward UI surfaces while requests wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// A request's current place in line
    #[serde(rename = "GET_QUEUE_POSITION")]
    Position {
        id: String,
        position: usize,
        total: usize,
    },
}

impl QueueEvent {
    /// Id of the request this event concerns
    pub fn request_id(&self) -> &str {
        match self {
            QueueEvent::Position { id, .. } => id,
        }
    }
}
