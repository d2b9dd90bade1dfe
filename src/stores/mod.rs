//! Contracts for the external platform pieces the client consumes: room
//! directory, membership, rounds, guesses, strokes, profiles, snapshot
//! storage. Durable copies live out there; the session only holds a view.
//!
//! Per-field race policies the implementations must keep: last-write-wins
//! upsert for room/host and membership fields, append-only strokes,
//! first-decided-wins for round outcomes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    Guess, Membership, Profile, ProfileId, Room, RoomCode, Round, RoundId, RoundOutcome,
    StrokeEvent, StrokePath, TopicId,
};

pub mod memory;
pub mod postgrest;

pub use memory::InMemoryBackend;
pub use postgrest::PostgrestBackend;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl ToString) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn exists(&self, code: &RoomCode) -> Result<bool, StoreError>;

    /// Creates the room with the given host. `Conflict` when the code is
    /// already claimed.
    async fn create(
        &self,
        code: &RoomCode,
        host: ProfileId,
        round_duration_secs: u32,
    ) -> Result<Room, StoreError>;

    async fn fetch(&self, code: &RoomCode) -> Result<Room, StoreError>;

    async fn set_active(&self, code: &RoomCode, active: bool) -> Result<(), StoreError>;

    /// Last-write-wins host upsert; concurrent failover writers are
    /// expected and tolerated.
    async fn set_host(&self, code: &RoomCode, host: ProfileId) -> Result<(), StoreError>;

    async fn delete(&self, code: &RoomCode) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert(&self, profile: &Profile) -> Result<(), StoreError>;
    async fn fetch(&self, id: ProfileId) -> Result<Option<Profile>, StoreError>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Upsert keyed by (room, profile). An existing row keeps its original
    /// join time; score and active flag are last-write-wins.
    async fn upsert(&self, membership: &Membership) -> Result<(), StoreError>;

    async fn fetch(
        &self,
        code: &RoomCode,
        profile: ProfileId,
    ) -> Result<Option<Membership>, StoreError>;

    /// Active memberships ordered by join time ascending; the failover
    /// procedure promotes the first entry.
    async fn list_active(&self, code: &RoomCode) -> Result<Vec<Membership>, StoreError>;

    async fn set_active(
        &self,
        code: &RoomCode,
        profile: ProfileId,
        active: bool,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn create(
        &self,
        code: &RoomCode,
        topic: TopicId,
        drawer: ProfileId,
    ) -> Result<Round, StoreError>;

    async fn get_by_id(&self, id: RoundId) -> Result<Round, StoreError>;

    /// Finalizes the outcome only when it is still undecided. Returns
    /// `true` when this call decided the round, `false` when a prior write
    /// already had.
    async fn set_outcome(&self, id: RoundId, outcome: RoundOutcome) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait GuessStore: Send + Sync {
    /// Upsert keyed by (round, profile); resubmission overwrites.
    async fn upsert(&self, guess: &Guess) -> Result<(), StoreError>;

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<Guess>, StoreError>;
}

#[async_trait]
pub trait StrokeLog: Send + Sync {
    /// Appends one path segment; replication to peers happens through the
    /// change feed, never through this interface.
    async fn append(&self, round: RoundId, path: StrokePath) -> Result<StrokeEvent, StoreError>;

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<StrokeEvent>, StoreError>;
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Uploads the final drawing; overwrite-on-conflict so the drawer may
    /// retry with the same round key.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    fn public_url(&self, key: &str) -> String;
}

/// Bundle of collaborator handles a session runs against.
#[derive(Clone)]
pub struct Backend {
    pub rooms: Arc<dyn RoomDirectory>,
    pub profiles: Arc<dyn ProfileStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub rounds: Arc<dyn RoundStore>,
    pub guesses: Arc<dyn GuessStore>,
    pub strokes: Arc<dyn StrokeLog>,
    pub snapshots: Arc<dyn SnapshotStorage>,
}

/// Object key for a round's final drawing.
pub fn snapshot_key(round: RoundId) -> String {
    format!("rounds/{round}.png")
}
