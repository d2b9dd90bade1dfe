//! Hosted-Postgres backend speaking PostgREST. One struct implements every
//! store trait; the schema follows the platform tables the game uses
//! (`art_rooms`, `art_users`, `art_room_users`, `art_rounds`, `art_guesses`,
//! `art_strokes`) plus an object bucket for final drawings.
//!
//! Concurrency policies map onto PostgREST verbs: room/membership writes are
//! upserts (last write wins), strokes are plain inserts, and the outcome
//! finalization is a filtered update that only matches an undecided row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgrest::Postgrest;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::{
    Guess, Membership, Profile, ProfileId, Room, RoomCode, Round, RoundId, RoundOutcome,
    StrokeEvent, StrokePath, TopicId,
};

use super::{
    Backend, GuessStore, MembershipStore, ProfileStore, RoomDirectory, RoundStore,
    SnapshotStorage, StoreError, StrokeLog,
};

#[derive(Clone, Debug)]
pub struct PostgrestConfig {
    /// PostgREST endpoint, e.g. `https://<project>.supabase.co/rest/v1`.
    pub rest_url: Url,
    /// Storage endpoint, e.g. `https://<project>.supabase.co/storage/v1`.
    pub storage_url: Url,
    pub api_key: String,
    /// Bucket holding final-drawing snapshots.
    pub snapshot_bucket: String,
}

pub struct PostgrestBackend {
    db: Postgrest,
    http: reqwest::Client,
    cfg: PostgrestConfig,
}

impl PostgrestBackend {
    pub fn new(cfg: PostgrestConfig) -> Arc<Self> {
        let db = Postgrest::new(cfg.rest_url.as_str())
            .insert_header("apikey", cfg.api_key.clone())
            .insert_header("Authorization", format!("Bearer {}", cfg.api_key))
            .insert_header("Prefer", "return=representation");
        Arc::new(Self {
            db,
            http: reqwest::Client::new(),
            cfg,
        })
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend {
            rooms: Arc::clone(self) as Arc<dyn RoomDirectory>,
            profiles: Arc::clone(self) as Arc<dyn ProfileStore>,
            memberships: Arc::clone(self) as Arc<dyn MembershipStore>,
            rounds: Arc::clone(self) as Arc<dyn RoundStore>,
            guesses: Arc::clone(self) as Arc<dyn GuessStore>,
            strokes: Arc::clone(self) as Arc<dyn StrokeLog>,
            snapshots: Arc::clone(self) as Arc<dyn SnapshotStorage>,
        }
    }
}

async fn rows<T: DeserializeOwned>(
    result: Result<reqwest::Response, reqwest::Error>,
    entity: &'static str,
) -> Result<Vec<T>, StoreError> {
    let response = result.map_err(StoreError::backend)?;
    match response.status() {
        status if status.is_success() => response.json().await.map_err(StoreError::backend),
        StatusCode::CONFLICT => Err(StoreError::Conflict(entity)),
        status => Err(StoreError::Backend(format!(
            "{entity}: unexpected status {status}"
        ))),
    }
}

async fn single<T: DeserializeOwned>(
    result: Result<reqwest::Response, reqwest::Error>,
    entity: &'static str,
) -> Result<T, StoreError> {
    rows(result, entity)
        .await?
        .into_iter()
        .next()
        .ok_or(StoreError::NotFound(entity))
}

fn body<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(StoreError::backend)
}

// ---- row shapes ---------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RoomRow {
    room_id: String,
    host_id: ProfileId,
    is_active: bool,
    round_duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

impl RoomRow {
    fn into_room(self) -> Option<Room> {
        Some(Room {
            code: RoomCode::parse(&self.room_id)?,
            host: self.host_id,
            is_active: self.is_active,
            round_duration_secs: self.round_duration.max(0) as u32,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileRow {
    user_id: ProfileId,
    name: String,
    character_img: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MembershipRow {
    room_id: String,
    user_id: ProfileId,
    score: i64,
    is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

impl MembershipRow {
    fn into_membership(self) -> Option<Membership> {
        Some(Membership {
            room: RoomCode::parse(&self.room_id)?,
            profile: self.user_id,
            joined_at: self.created_at.unwrap_or_else(Utc::now),
            score: self.score,
            is_active: self.is_active,
        })
    }
}

const WINNER_UNDECIDED: &str = "undecided";
const WINNER_GUESSERS: &str = "guessers";
const WINNER_MODEL: &str = "model";

fn winner_label(outcome: RoundOutcome) -> &'static str {
    match outcome {
        RoundOutcome::Undecided => WINNER_UNDECIDED,
        RoundOutcome::GuessersWin => WINNER_GUESSERS,
        RoundOutcome::ModelWins => WINNER_MODEL,
    }
}

fn winner_outcome(label: &str) -> RoundOutcome {
    match label {
        WINNER_GUESSERS => RoundOutcome::GuessersWin,
        WINNER_MODEL => RoundOutcome::ModelWins,
        _ => RoundOutcome::Undecided,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RoundRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RoundId>,
    room_id: String,
    round_no: i64,
    topic_id: TopicId,
    drawer_id: ProfileId,
    winner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

impl RoundRow {
    fn into_round(self) -> Option<Round> {
        Some(Round {
            id: self.id?,
            room: RoomCode::parse(&self.room_id)?,
            round_no: self.round_no,
            topic: self.topic_id,
            drawer: self.drawer_id,
            outcome: winner_outcome(&self.winner),
            started_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GuessRow {
    round_id: RoundId,
    user_id: ProfileId,
    guess: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StrokeRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    round_id: RoundId,
    path: StrokePath,
}

// ---- trait implementations ----------------------------------------------

#[async_trait]
impl RoomDirectory for PostgrestBackend {
    async fn exists(&self, code: &RoomCode) -> Result<bool, StoreError> {
        let found: Vec<RoomRow> = rows(
            self.db
                .from("art_rooms")
                .select("*")
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "room",
        )
        .await?;
        Ok(!found.is_empty())
    }

    async fn create(
        &self,
        code: &RoomCode,
        host: ProfileId,
        round_duration_secs: u32,
    ) -> Result<Room, StoreError> {
        if self.exists(code).await? {
            return Err(StoreError::Conflict("room"));
        }
        let row = RoomRow {
            room_id: code.as_str().to_string(),
            host_id: host,
            is_active: false,
            round_duration: round_duration_secs as i64,
            created_at: None,
        };
        let created: RoomRow = single(
            self.db.from("art_rooms").insert(body(&row)?).execute().await,
            "room",
        )
        .await?;
        created.into_room().ok_or(StoreError::NotFound("room"))
    }

    async fn fetch(&self, code: &RoomCode) -> Result<Room, StoreError> {
        let row: RoomRow = single(
            self.db
                .from("art_rooms")
                .select("*")
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "room",
        )
        .await?;
        row.into_room().ok_or(StoreError::NotFound("room"))
    }

    async fn set_active(&self, code: &RoomCode, active: bool) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "is_active": active });
        rows::<serde_json::Value>(
            self.db
                .from("art_rooms")
                .update(patch.to_string())
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "room",
        )
        .await?;
        Ok(())
    }

    async fn set_host(&self, code: &RoomCode, host: ProfileId) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "host_id": host });
        rows::<serde_json::Value>(
            self.db
                .from("art_rooms")
                .update(patch.to_string())
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "room",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, code: &RoomCode) -> Result<(), StoreError> {
        rows::<serde_json::Value>(
            self.db
                .from("art_room_users")
                .delete()
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "membership",
        )
        .await?;
        rows::<serde_json::Value>(
            self.db
                .from("art_rooms")
                .delete()
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "room",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PostgrestBackend {
    async fn upsert(&self, profile: &Profile) -> Result<(), StoreError> {
        let row = ProfileRow {
            user_id: profile.id,
            name: profile.name.clone(),
            character_img: profile.avatar.clone(),
        };
        rows::<serde_json::Value>(
            self.db.from("art_users").upsert(body(&row)?).execute().await,
            "profile",
        )
        .await?;
        Ok(())
    }

    async fn fetch(&self, id: ProfileId) -> Result<Option<Profile>, StoreError> {
        let found: Vec<ProfileRow> = rows(
            self.db
                .from("art_users")
                .select("*")
                .eq("user_id", id.to_string())
                .execute()
                .await,
            "profile",
        )
        .await?;
        Ok(found.into_iter().next().map(|row| Profile {
            id: row.user_id,
            name: row.name,
            avatar: row.character_img,
        }))
    }
}

#[async_trait]
impl MembershipStore for PostgrestBackend {
    async fn upsert(&self, membership: &Membership) -> Result<(), StoreError> {
        let row = MembershipRow {
            room_id: membership.room.as_str().to_string(),
            user_id: membership.profile,
            score: membership.score,
            is_active: membership.is_active,
            created_at: None,
        };
        rows::<serde_json::Value>(
            self.db
                .from("art_room_users")
                .upsert(body(&row)?)
                .execute()
                .await,
            "membership",
        )
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        code: &RoomCode,
        profile: ProfileId,
    ) -> Result<Option<Membership>, StoreError> {
        let found: Vec<MembershipRow> = rows(
            self.db
                .from("art_room_users")
                .select("*")
                .eq("room_id", code.as_str())
                .eq("user_id", profile.to_string())
                .execute()
                .await,
            "membership",
        )
        .await?;
        Ok(found.into_iter().next().and_then(MembershipRow::into_membership))
    }

    async fn list_active(&self, code: &RoomCode) -> Result<Vec<Membership>, StoreError> {
        let found: Vec<MembershipRow> = rows(
            self.db
                .from("art_room_users")
                .select("*")
                .eq("room_id", code.as_str())
                .eq("is_active", "true")
                .order("created_at.asc")
                .execute()
                .await,
            "membership",
        )
        .await?;
        Ok(found
            .into_iter()
            .filter_map(MembershipRow::into_membership)
            .collect())
    }

    async fn set_active(
        &self,
        code: &RoomCode,
        profile: ProfileId,
        active: bool,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "is_active": active });
        rows::<serde_json::Value>(
            self.db
                .from("art_room_users")
                .update(patch.to_string())
                .eq("room_id", code.as_str())
                .eq("user_id", profile.to_string())
                .execute()
                .await,
            "membership",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RoundStore for PostgrestBackend {
    async fn create(
        &self,
        code: &RoomCode,
        topic: TopicId,
        drawer: ProfileId,
    ) -> Result<Round, StoreError> {
        let prior: Vec<serde_json::Value> = rows(
            self.db
                .from("art_rounds")
                .select("id")
                .eq("room_id", code.as_str())
                .execute()
                .await,
            "round",
        )
        .await?;
        let row = RoundRow {
            id: None,
            room_id: code.as_str().to_string(),
            round_no: prior.len() as i64 + 1,
            topic_id: topic,
            drawer_id: drawer,
            winner: WINNER_UNDECIDED.to_string(),
            created_at: None,
        };
        let created: RoundRow = single(
            self.db.from("art_rounds").insert(body(&row)?).execute().await,
            "round",
        )
        .await?;
        created.into_round().ok_or(StoreError::NotFound("round"))
    }

    async fn get_by_id(&self, id: RoundId) -> Result<Round, StoreError> {
        let row: RoundRow = single(
            self.db
                .from("art_rounds")
                .select("*")
                .eq("id", id.to_string())
                .execute()
                .await,
            "round",
        )
        .await?;
        row.into_round().ok_or(StoreError::NotFound("round"))
    }

    async fn set_outcome(&self, id: RoundId, outcome: RoundOutcome) -> Result<bool, StoreError> {
        // Filtered update: only an undecided row matches, so the first
        // writer decides and later writers update zero rows.
        let patch = serde_json::json!({ "winner": winner_label(outcome) });
        let updated: Vec<serde_json::Value> = rows(
            self.db
                .from("art_rounds")
                .update(patch.to_string())
                .eq("id", id.to_string())
                .eq("winner", WINNER_UNDECIDED)
                .execute()
                .await,
            "round",
        )
        .await?;
        Ok(!updated.is_empty())
    }
}

#[async_trait]
impl GuessStore for PostgrestBackend {
    async fn upsert(&self, guess: &Guess) -> Result<(), StoreError> {
        let row = GuessRow {
            round_id: guess.round,
            user_id: guess.profile,
            guess: guess.text.clone(),
            confidence: guess.confidence,
        };
        rows::<serde_json::Value>(
            self.db.from("art_guesses").upsert(body(&row)?).execute().await,
            "guess",
        )
        .await?;
        Ok(())
    }

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<Guess>, StoreError> {
        let found: Vec<GuessRow> = rows(
            self.db
                .from("art_guesses")
                .select("*")
                .eq("round_id", round.to_string())
                .execute()
                .await,
            "guess",
        )
        .await?;
        Ok(found
            .into_iter()
            .map(|row| Guess {
                round: row.round_id,
                profile: row.user_id,
                text: row.guess,
                confidence: row.confidence,
            })
            .collect())
    }
}

#[async_trait]
impl StrokeLog for PostgrestBackend {
    async fn append(&self, round: RoundId, path: StrokePath) -> Result<StrokeEvent, StoreError> {
        let row = StrokeRow {
            id: None,
            round_id: round,
            path,
        };
        let created: StrokeRow = single(
            self.db.from("art_strokes").insert(body(&row)?).execute().await,
            "stroke",
        )
        .await?;
        Ok(StrokeEvent {
            round: created.round_id,
            seq: created.id.unwrap_or_default(),
            path: created.path,
        })
    }

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<StrokeEvent>, StoreError> {
        let found: Vec<StrokeRow> = rows(
            self.db
                .from("art_strokes")
                .select("*")
                .eq("round_id", round.to_string())
                .order("id.asc")
                .execute()
                .await,
            "stroke",
        )
        .await?;
        Ok(found
            .into_iter()
            .map(|row| StrokeEvent {
                round: row.round_id,
                seq: row.id.unwrap_or_default(),
                path: row.path,
            })
            .collect())
    }
}

#[async_trait]
impl SnapshotStorage for PostgrestBackend {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let url = format!(
            "{}/object/{}/{}",
            self.cfg.storage_url.as_str().trim_end_matches('/'),
            self.cfg.snapshot_bucket,
            key
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .header("apikey", self.cfg.api_key.as_str())
            .header("x-upsert", "true")
            .header("content-type", "image/png")
            .body(bytes)
            .send()
            .await
            .map_err(StoreError::backend)?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "snapshot upload failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/object/public/{}/{}",
            self.cfg.storage_url.as_str().trim_end_matches('/'),
            self.cfg.snapshot_bucket,
            key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winner_labels_round_trip() {
        for outcome in [
            RoundOutcome::Undecided,
            RoundOutcome::GuessersWin,
            RoundOutcome::ModelWins,
        ] {
            assert_eq!(winner_outcome(winner_label(outcome)), outcome);
        }
        assert_eq!(winner_outcome("garbage"), RoundOutcome::Undecided);
    }

    #[test]
    fn room_row_maps_duration_and_code() {
        let row = RoomRow {
            room_id: "ABCD".into(),
            host_id: uuid::Uuid::new_v4(),
            is_active: true,
            round_duration: 45,
            created_at: Some(Utc::now()),
        };
        let room = row.into_room().unwrap();
        assert_eq!(room.code.as_str(), "ABCD");
        assert_eq!(room.round_duration_secs, 45);
    }
}
