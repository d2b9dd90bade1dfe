use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod topics;

pub use topics::{draw_topic_choices, topic_text};

/// Stable anonymous identity of a browser/client.
pub type ProfileId = Uuid;

/// Database identifier of a round.
pub type RoundId = i64;

/// Identifier into the fixed topic catalog.
pub type TopicId = i64;

/// Synthetic profile under which the AI's guesses are recorded. Privileged:
/// it is never a room member and never draws.
pub const MODEL_PROFILE_ID: ProfileId = Uuid::from_u128(0x00ac_11fe_d00d_4000_8000_0000_0000_0001);

/// Human-chosen room identifier. Whitespace-trimmed, never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel topic scoped to this room; one presence/broadcast topic per
    /// room, every member subscribes to the same one.
    pub fn channel_topic(&self) -> String {
        format!("room:{}", self.0)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display profile owned by a single client. Upserted whenever the owner
/// edits their name or avatar; never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub avatar: String,
}

/// Client-side view of a room row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    pub host: ProfileId,
    pub is_active: bool,
    pub round_duration_secs: u32,
    pub created_at: DateTime<Utc>,
}

/// A profile's participation record within a room. Unique per
/// (room, profile); deactivated on disconnect, reactivated on rejoin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub room: RoomCode,
    pub profile: ProfileId,
    pub joined_at: DateTime<Utc>,
    pub score: i64,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Undecided,
    /// A human guess matched the topic first.
    GuessersWin,
    /// The model's similarity peaked or its label matched the topic first.
    ModelWins,
}

impl RoundOutcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, RoundOutcome::Undecided)
    }
}

/// One draw-and-guess cycle. Exactly one drawer; the outcome is finalized
/// at most once (first writer wins).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub room: RoomCode,
    pub round_no: i64,
    pub topic: TopicId,
    pub drawer: ProfileId,
    pub outcome: RoundOutcome,
    pub started_at: DateTime<Utc>,
}

/// A human or model guess for a round. One live row per (round, profile),
/// overwritten on resubmission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Guess {
    pub round: RoundId,
    pub profile: ProfileId,
    pub text: String,
    pub confidence: Option<f64>,
}

/// A freehand path segment captured by the drawing surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokePath {
    pub points: Vec<[f32; 2]>,
    pub is_eraser: bool,
}

/// An appended stroke as observed through the change feed. Per-round order
/// is the append order each client observes; there is no global order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokeEvent {
    pub round: RoundId,
    pub seq: i64,
    pub path: StrokePath,
}

/// Label plus confidence returned by the prediction endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_trims_and_rejects_empty() {
        assert_eq!(RoomCode::parse("  ABCD ").unwrap().as_str(), "ABCD");
        assert!(RoomCode::parse("   ").is_none());
        assert!(RoomCode::parse("").is_none());
    }

    #[test]
    fn room_code_topic_is_room_scoped() {
        let code = RoomCode::parse("ABCD").unwrap();
        assert_eq!(code.channel_topic(), "room:ABCD");
    }

    #[test]
    fn model_profile_is_stable() {
        assert_ne!(MODEL_PROFILE_ID, Uuid::nil());
        assert_eq!(
            MODEL_PROFILE_ID.to_string(),
            "00ac11fe-d00d-4000-8000-000000000001"
        );
    }
}
