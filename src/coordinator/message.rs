//! Message contract between UI surfaces and the coordinator

use crate::api::ImproveOutcome;
use crate::queue::QueueStatus;
use serde::{Deserialize, Serialize};

/// Requests a UI surface can send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiRequest {
    /// Improve the selected text
    #[serde(rename = "IMPROVE_PROMPT")]
    ImprovePrompt {
        text: String,
        /// Optional request id, usable for cancellation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Drop a request that has not started yet
    #[serde(rename = "CANCEL_REQUEST")]
    CancelRequest { id: String },

    /// Queue occupancy
    #[serde(rename = "GET_QUEUE_STATUS")]
    GetQueueStatus,
}

/// Replies sent back to the UI surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UiReply {
    /// `{result}` or `{error}`
    Outcome(ImproveOutcome),
    Cancelled { cancelled: bool },
    Status(QueueStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_improve_request() {
        let request: UiRequest =
            serde_json::from_value(json!({"type": "IMPROVE_PROMPT", "text": "hello"})).unwrap();
        assert_eq!(
            request,
            UiRequest::ImprovePrompt {
                text: "hello".into(),
                id: None
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed: Result<UiRequest, _> =
            serde_json::from_value(json!({"type": "OPEN_OPTIONS"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_reply_shapes() {
        let reply = UiReply::Outcome(ImproveOutcome::Failure {
            error: "No text selected".into(),
        });
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"error": "No text selected"})
        );
        assert_eq!(
            serde_json::to_value(UiReply::Cancelled { cancelled: true }).unwrap(),
            json!({"cancelled": true})
        );
    }
}
