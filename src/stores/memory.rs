//! In-memory backend used by tests and the demo binary. Mirrors the durable
//! per-field policies: LWW upserts, append-only strokes, first-decided-wins
//! outcomes. Stroke appends and room updates are re-published on broadcast
//! channels so a hub can play the role of the change feed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::{
    Guess, Membership, Profile, ProfileId, Room, RoomCode, Round, RoundId, RoundOutcome,
    StrokeEvent, StrokePath, TopicId,
};

use super::{
    Backend, GuessStore, MembershipStore, ProfileStore, RoomDirectory, RoundStore,
    SnapshotStorage, StoreError, StrokeLog,
};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    rooms: HashMap<RoomCode, Room>,
    profiles: HashMap<ProfileId, Profile>,
    memberships: HashMap<(RoomCode, ProfileId), Membership>,
    rounds: HashMap<RoundId, Round>,
    next_round_id: RoundId,
    guesses: HashMap<(RoundId, ProfileId), Guess>,
    strokes: HashMap<RoundId, Vec<StrokeEvent>>,
    snapshots: HashMap<String, Vec<u8>>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    room_feed: broadcast::Sender<Room>,
    stroke_feed: broadcast::Sender<StrokeEvent>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        let (room_feed, _) = broadcast::channel(FEED_CAPACITY);
        let (stroke_feed, _) = broadcast::channel(FEED_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(State::default()),
            room_feed,
            stroke_feed,
        })
    }

    /// Change feed of room row updates (host reassignment, active flag).
    pub fn room_feed(&self) -> broadcast::Receiver<Room> {
        self.room_feed.subscribe()
    }

    /// Change feed of appended strokes.
    pub fn stroke_feed(&self) -> broadcast::Receiver<StrokeEvent> {
        self.stroke_feed.subscribe()
    }

    /// Collaborator bundle backed by this instance.
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

#[async_trait]
impl RoomDirectory for InMemoryBackend {
    async fn exists(&self, code: &RoomCode) -> Result<bool, StoreError> {
        Ok(self.state.lock().rooms.contains_key(code))
    }

    async fn create(
        &self,
        code: &RoomCode,
        host: ProfileId,
        round_duration_secs: u32,
    ) -> Result<Room, StoreError> {
        let mut state = self.state.lock();
        if state.rooms.contains_key(code) {
            return Err(StoreError::Conflict("room"));
        }
        let room = Room {
            code: code.clone(),
            host,
            is_active: false,
            round_duration_secs,
            created_at: Utc::now(),
        };
        state.rooms.insert(code.clone(), room.clone());
        Ok(room)
    }

    async fn fetch(&self, code: &RoomCode) -> Result<Room, StoreError> {
        self.state
            .lock()
            .rooms
            .get(code)
            .cloned()
            .ok_or(StoreError::NotFound("room"))
    }

    async fn set_active(&self, code: &RoomCode, active: bool) -> Result<(), StoreError> {
        let updated = {
            let mut state = self.state.lock();
            let room = state.rooms.get_mut(code).ok_or(StoreError::NotFound("room"))?;
            room.is_active = active;
            room.clone()
        };
        let _ = self.room_feed.send(updated);
        Ok(())
    }

    async fn set_host(&self, code: &RoomCode, host: ProfileId) -> Result<(), StoreError> {
        let updated = {
            let mut state = self.state.lock();
            let room = state.rooms.get_mut(code).ok_or(StoreError::NotFound("room"))?;
            room.host = host;
            room.clone()
        };
        let _ = self.room_feed.send(updated);
        Ok(())
    }

    async fn delete(&self, code: &RoomCode) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.rooms.remove(code);
        state.memberships.retain(|(room, _), _| room != code);
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for InMemoryBackend {
    async fn upsert(&self, profile: &Profile) -> Result<(), StoreError> {
        self.state
            .lock()
            .profiles
            .insert(profile.id, profile.clone());
        Ok(())
    }

    async fn fetch(&self, id: ProfileId) -> Result<Option<Profile>, StoreError> {
        Ok(self.state.lock().profiles.get(&id).cloned())
    }
}

#[async_trait]
impl MembershipStore for InMemoryBackend {
    async fn upsert(&self, membership: &Membership) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let key = (membership.room.clone(), membership.profile);
        match state.memberships.get_mut(&key) {
            Some(existing) => {
                // Join time is sticky across rejoins; everything else LWW.
                existing.score = membership.score;
                existing.is_active = membership.is_active;
            }
            None => {
                state.memberships.insert(key, membership.clone());
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        code: &RoomCode,
        profile: ProfileId,
    ) -> Result<Option<Membership>, StoreError> {
        Ok(self
            .state
            .lock()
            .memberships
            .get(&(code.clone(), profile))
            .cloned())
    }

    async fn list_active(&self, code: &RoomCode) -> Result<Vec<Membership>, StoreError> {
        let state = self.state.lock();
        let mut active: Vec<Membership> = state
            .memberships
            .values()
            .filter(|m| &m.room == code && m.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.profile.cmp(&b.profile))
        });
        Ok(active)
    }

    async fn set_active(
        &self,
        code: &RoomCode,
        profile: ProfileId,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(membership) = state.memberships.get_mut(&(code.clone(), profile)) {
            membership.is_active = active;
        }
        Ok(())
    }
}

#[async_trait]
impl RoundStore for InMemoryBackend {
    async fn create(
        &self,
        code: &RoomCode,
        topic: TopicId,
        drawer: ProfileId,
    ) -> Result<Round, StoreError> {
        let mut state = self.state.lock();
        state.next_round_id += 1;
        let id = state.next_round_id;
        let round_no = state.rounds.values().filter(|r| &r.room == code).count() as i64 + 1;
        let round = Round {
            id,
            room: code.clone(),
            round_no,
            topic,
            drawer,
            outcome: RoundOutcome::Undecided,
            started_at: Utc::now(),
        };
        state.rounds.insert(id, round.clone());
        Ok(round)
    }

    async fn get_by_id(&self, id: RoundId) -> Result<Round, StoreError> {
        self.state
            .lock()
            .rounds
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("round"))
    }

    async fn set_outcome(&self, id: RoundId, outcome: RoundOutcome) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let round = state.rounds.get_mut(&id).ok_or(StoreError::NotFound("round"))?;
        if round.outcome.is_decided() {
            return Ok(false);
        }
        round.outcome = outcome;
        Ok(true)
    }
}

#[async_trait]
impl GuessStore for InMemoryBackend {
    async fn upsert(&self, guess: &Guess) -> Result<(), StoreError> {
        self.state
            .lock()
            .guesses
            .insert((guess.round, guess.profile), guess.clone());
        Ok(())
    }

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<Guess>, StoreError> {
        Ok(self
            .state
            .lock()
            .guesses
            .values()
            .filter(|g| g.round == round)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StrokeLog for InMemoryBackend {
    async fn append(&self, round: RoundId, path: StrokePath) -> Result<StrokeEvent, StoreError> {
        let event = {
            let mut state = self.state.lock();
            let log = state.strokes.entry(round).or_default();
            let event = StrokeEvent {
                round,
                seq: log.len() as i64 + 1,
                path,
            };
            log.push(event.clone());
            event
        };
        let _ = self.stroke_feed.send(event.clone());
        Ok(event)
    }

    async fn list_by_round(&self, round: RoundId) -> Result<Vec<StrokeEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .strokes
            .get(&round)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotStorage for InMemoryBackend {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.state.lock().snapshots.insert(key.to_string(), bytes);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://snapshots/{key}")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;

    fn code(raw: &str) -> RoomCode {
        RoomCode::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn duplicate_room_create_conflicts() {
        let backend = InMemoryBackend::new().backend();
        let host = Uuid::new_v4();
        backend.rooms.create(&code("ABCD"), host, 45).await.unwrap();
        let err = backend
            .rooms
            .create(&code("ABCD"), host, 45)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict("room")));
    }

    #[tokio::test]
    async fn membership_upsert_keeps_join_time() {
        let backend = InMemoryBackend::new().backend();
        let profile = Uuid::new_v4();
        let first = Membership {
            room: code("ABCD"),
            profile,
            joined_at: Utc::now() - Duration::seconds(30),
            score: 0,
            is_active: true,
        };
        backend.memberships.upsert(&first).await.unwrap();

        let rejoin = Membership {
            joined_at: Utc::now(),
            score: 100,
            ..first.clone()
        };
        backend.memberships.upsert(&rejoin).await.unwrap();

        let stored = backend
            .memberships
            .fetch(&code("ABCD"), profile)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.joined_at, first.joined_at);
        assert_eq!(stored.score, 100);
    }

    #[tokio::test]
    async fn list_active_orders_by_join_time() {
        let backend = InMemoryBackend::new().backend();
        let room = code("ABCD");
        let earlier = Uuid::new_v4();
        let later = Uuid::new_v4();
        let base = Utc::now();
        for (profile, offset, active) in [
            (later, 10, true),
            (earlier, 0, true),
            (Uuid::new_v4(), 5, false),
        ] {
            backend
                .memberships
                .upsert(&Membership {
                    room: room.clone(),
                    profile,
                    joined_at: base + Duration::seconds(offset),
                    score: 0,
                    is_active: active,
                })
                .await
                .unwrap();
        }

        let active = backend.memberships.list_active(&room).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].profile, earlier);
        assert_eq!(active[1].profile, later);
    }

    #[tokio::test]
    async fn round_outcome_is_write_once() {
        let backend = InMemoryBackend::new().backend();
        let round = backend
            .rounds
            .create(&code("ABCD"), 1, Uuid::new_v4())
            .await
            .unwrap();

        assert!(backend
            .rounds
            .set_outcome(round.id, RoundOutcome::GuessersWin)
            .await
            .unwrap());
        assert!(!backend
            .rounds
            .set_outcome(round.id, RoundOutcome::ModelWins)
            .await
            .unwrap());

        let stored = backend.rounds.get_by_id(round.id).await.unwrap();
        assert_eq!(stored.outcome, RoundOutcome::GuessersWin);
    }

    #[tokio::test]
    async fn guess_upsert_is_idempotent_per_player() {
        let backend = InMemoryBackend::new().backend();
        let round = backend
            .rounds
            .create(&code("ABCD"), 1, Uuid::new_v4())
            .await
            .unwrap();
        let player = Uuid::new_v4();

        for text in ["appel", "apple"] {
            backend
                .guesses
                .upsert(&Guess {
                    round: round.id,
                    profile: player,
                    text: text.into(),
                    confidence: None,
                })
                .await
                .unwrap();
        }

        let guesses = backend.guesses.list_by_round(round.id).await.unwrap();
        assert_eq!(guesses.len(), 1);
        assert_eq!(guesses[0].text, "apple");
    }

    #[tokio::test]
    async fn strokes_append_in_order_and_feed_out() {
        let store = InMemoryBackend::new();
        let backend = store.backend();
        let mut feed = store.stroke_feed();
        for _ in 0..3 {
            backend
                .strokes
                .append(
                    7,
                    StrokePath {
                        points: vec![[0.0, 0.0], [1.0, 1.0]],
                        is_eraser: false,
                    },
                )
                .await
                .unwrap();
        }
        let log = backend.strokes.list_by_round(7).await.unwrap();
        assert_eq!(log.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(feed.recv().await.unwrap().seq, 1);
    }
}
