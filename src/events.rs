//! Broadcast events exchanged between room members.
//!
//! Payloads on the wire are an event name plus a small named-field record.
//! They decode into one closed union; anything unknown or malformed is
//! dropped at the channel boundary rather than surfaced as an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{ProfileId, RoundId};

const LOG_TARGET: &str = "events";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// Host starts round setup; the named drawer picks a topic, everyone
    /// else waits.
    OpenTopicDialog { drawer: ProfileId },
    /// The drawer committed to a topic; receivers start their countdown.
    /// Carries no topic text: clients re-fetch the round by id.
    TopicClosed,
    /// Identifier of the freshly created round. May arrive before or after
    /// `TopicClosed`; receivers tolerate either order.
    RoundIdUpdate { round_id: RoundId },
    /// Display-only echo of a guess; the durable upsert is the source of
    /// truth.
    GuessAdded { profile: ProfileId, text: String },
    /// Latest model prediction plus its similarity to the topic.
    PredictionUpdate {
        label: String,
        confidence: f64,
        similarity: f64,
    },
    /// The drawer finished the round; everyone navigates to review.
    RoundEnds { round_id: RoundId },
    /// The drawer wiped the canvas.
    CanvasClear,
}

impl RoomEvent {
    /// Wire name used as the broadcast discriminator.
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::OpenTopicDialog { .. } => "open-topic-dialog",
            RoomEvent::TopicClosed => "topic-closed",
            RoomEvent::RoundIdUpdate { .. } => "round-id-update",
            RoomEvent::GuessAdded { .. } => "guess-added",
            RoomEvent::PredictionUpdate { .. } => "prediction-update",
            RoomEvent::RoundEnds { .. } => "round-ends",
            RoomEvent::CanvasClear => "canvas-clear",
        }
    }

    /// Payload record for the wire, without the discriminator.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get("payload").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Decodes a named broadcast payload. Unknown names and shape
    /// mismatches yield `None`; receivers ignore them.
    pub fn decode(event: &str, payload: Value) -> Option<RoomEvent> {
        let tagged = serde_json::json!({ "event": event, "payload": payload });
        match serde_json::from_value(tagged) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                debug!(target = LOG_TARGET, event, error = %err, "dropping undecodable broadcast");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn names_round_trip_through_decode() {
        let drawer = Uuid::new_v4();
        let events = vec![
            RoomEvent::OpenTopicDialog { drawer },
            RoomEvent::TopicClosed,
            RoomEvent::RoundIdUpdate { round_id: 42 },
            RoomEvent::GuessAdded {
                profile: drawer,
                text: "banana".into(),
            },
            RoomEvent::PredictionUpdate {
                label: "fruit".into(),
                confidence: 0.8,
                similarity: 0.55,
            },
            RoomEvent::RoundEnds { round_id: 42 },
            RoomEvent::CanvasClear,
        ];
        for event in events {
            let decoded = RoomEvent::decode(event.name(), event.payload()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn unknown_event_names_are_dropped() {
        assert!(RoomEvent::decode("mystery-event", serde_json::json!({})).is_none());
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert!(RoomEvent::decode("round-id-update", serde_json::json!({"round_id": "nope"})).is_none());
        assert!(RoomEvent::decode("open-topic-dialog", serde_json::json!({})).is_none());
    }

    #[test]
    fn unit_variants_survive_missing_payload() {
        assert_eq!(
            RoomEvent::decode("canvas-clear", Value::Null),
            Some(RoomEvent::CanvasClear)
        );
    }
}
