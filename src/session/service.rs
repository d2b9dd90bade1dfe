//! The session object: owns the channel subscription and the state machine,
//! runs the driver loop that consumes the inbox, and exposes the game-level
//! operations. One `Session` per joined room per client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ChannelFactory, ChannelMessage, RoomChannel, Subscription};
use crate::config::GameConfig;
use crate::domain::{
    draw_topic_choices, topic_text, Guess, Membership, Profile, ProfileId, RoomCode, Round,
    RoundId, RoundOutcome, StrokePath, TopicId,
};
use crate::events::RoomEvent;
use crate::predict::PredictionClient;
use crate::round::{DrawerWorkflow, SketchSurface};
use crate::stores::{snapshot_key, Backend, StoreError};

use super::error::SessionError;
use super::inbox::SessionInbox;
use super::state::{Effect, Input, RoomMachine, SessionPhase, SessionView};

const LOG_TARGET: &str = "session::service";

/// Everything a session needs injected: collaborator handles plus the game
/// configuration. Cheap to clone; one context serves many sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub cfg: GameConfig,
    pub backend: Backend,
    pub channels: Arc<dyn ChannelFactory>,
    pub prediction: Arc<dyn PredictionClient>,
    pub surface: Arc<dyn SketchSurface>,
}

/// Data backing the review screen after a round ends.
#[derive(Clone, Debug)]
pub struct ReviewSummary {
    pub round: Round,
    pub snapshot_url: String,
    pub guesses: Vec<Guess>,
}

pub struct Session {
    profile: Profile,
    room_code: RoomCode,
    cfg: GameConfig,
    backend: Backend,
    channel: Arc<dyn RoomChannel>,
    inbox: Arc<SessionInbox>,
    updates: watch::Receiver<SessionView>,
    stop: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Claims a room code for a new room. The creator still joins through
    /// [`Session::open`] afterwards.
    pub async fn create_room(
        ctx: &SessionContext,
        code: &RoomCode,
        host: &Profile,
    ) -> Result<(), SessionError> {
        ctx.backend.profiles.upsert(host).await?;
        match ctx
            .backend
            .rooms
            .create(code, host.id, ctx.cfg.round_duration_secs())
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(_)) => Err(SessionError::RoomExists(code.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Joins an existing room: directory check, channel subscription,
    /// membership upsert, presence track. On success the session sits in
    /// the lobby; on any failure the caller holds nothing and may retry.
    pub async fn open(
        ctx: SessionContext,
        code: RoomCode,
        profile: Profile,
    ) -> Result<Session, SessionError> {
        if !ctx.backend.rooms.exists(&code).await? {
            return Err(SessionError::RoomNotFound(code));
        }
        ctx.backend.profiles.upsert(&profile).await?;

        let mut machine = RoomMachine::new(ctx.cfg.clone(), profile.id);
        machine.begin_join();

        let Subscription {
            channel,
            mut messages,
        } = ctx
            .channels
            .join(&code, profile.id)
            .await
            .map_err(|err| SessionError::ChannelSubscriptionFailed(err.to_string()))?;

        // Rejoins keep the accumulated score; the join time is sticky in
        // the store.
        let score = ctx
            .backend
            .memberships
            .fetch(&code, profile.id)
            .await?
            .map(|m| m.score)
            .unwrap_or(0);
        ctx.backend
            .memberships
            .upsert(&Membership {
                room: code.clone(),
                profile: profile.id,
                joined_at: Utc::now(),
                score,
                is_active: true,
            })
            .await?;

        channel
            .track(profile.id)
            .await
            .map_err(|err| SessionError::ChannelSubscriptionFailed(err.to_string()))?;

        let room = ctx.backend.rooms.fetch(&code).await?;
        machine.apply(Input::Joined { room });

        let inbox = Arc::new(SessionInbox::new(64));
        let stop = CancellationToken::new();

        let forward_inbox = Arc::clone(&inbox);
        let forward_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = forward_stop.cancelled() => break,
                    received = messages.recv() => match received {
                        Some(message) => message,
                        None => {
                            let _ = forward_inbox.push(Input::ChannelLost);
                            break;
                        }
                    },
                };
                let input = match message {
                    ChannelMessage::PresenceSync { members } => Input::PresenceSync { members },
                    ChannelMessage::PresenceJoin { profile } => Input::PresenceJoin { profile },
                    ChannelMessage::PresenceLeave { profile } => Input::PresenceLeave { profile },
                    ChannelMessage::Broadcast(event) => Input::Event(event),
                    ChannelMessage::RoomChanged(room) => Input::RoomChanged { room },
                    ChannelMessage::StrokeAppended(stroke) => Input::StrokeAppended { stroke },
                    ChannelMessage::Closed => Input::ChannelLost,
                };
                let closing = matches!(input, Input::ChannelLost);
                if forward_inbox.push(input).is_err() || closing {
                    break;
                }
            }
        });

        let workflow = Arc::new(DrawerWorkflow::new(
            ctx.backend.clone(),
            Arc::clone(&ctx.prediction),
            Arc::clone(&ctx.surface),
        ));
        let (updates_tx, updates_rx) = watch::channel(machine.view());

        info!(target = LOG_TARGET, room = %code, profile = %profile.id, "session opened");

        let driver = Driver {
            machine,
            backend: ctx.backend.clone(),
            channel: Arc::clone(&channel),
            workflow,
            inbox: Arc::clone(&inbox),
            updates: updates_tx,
            notices: Vec::new(),
            ticker: None,
            room_code: code.clone(),
            settle_delay: ctx.cfg.settle_delay,
        };
        let driver_stop = stop.clone();
        let handle = tokio::spawn(driver.run(driver_stop));

        Ok(Session {
            profile,
            room_code: code,
            cfg: ctx.cfg,
            backend: ctx.backend,
            channel,
            inbox,
            updates: updates_rx,
            stop,
            driver: Some(handle),
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Latest published view of the room.
    pub fn view(&self) -> SessionView {
        self.updates.borrow().clone()
    }

    /// Watch stream for the presentation layer.
    pub fn updates(&self) -> watch::Receiver<SessionView> {
        self.updates.clone()
    }

    /// Host-only: flags the room active and opens the topic dialog on every
    /// client via broadcast. Fire-and-forget, no barrier.
    pub async fn start_round(&self) -> Result<(), SessionError> {
        let view = self.view();
        if !view.is_host_profile(self.profile.id) {
            return Err(SessionError::NotHost);
        }
        if view.active_member_count() < self.cfg.min_players {
            return Err(SessionError::InsufficientPlayers {
                min: self.cfg.min_players,
            });
        }
        self.backend.rooms.set_active(&self.room_code, true).await?;
        self.channel
            .send(RoomEvent::OpenTopicDialog {
                drawer: self.profile.id,
            })
            .await?;
        Ok(())
    }

    /// Topics offered to the drawer: distinct draws from the catalog.
    pub fn topic_choices(&self) -> Vec<TopicId> {
        draw_topic_choices(&mut rand::thread_rng(), self.cfg.topic_choices)
    }

    /// Drawer-only: creates the round record and announces it. Every
    /// client, this one included, transitions on the echoed broadcasts.
    pub async fn choose_topic(&self, topic: TopicId) -> Result<RoundId, SessionError> {
        let view = self.view();
        match view.phase {
            SessionPhase::RoundSetup { drawer } if drawer == self.profile.id => {}
            _ => return Err(SessionError::NotDrawer),
        }
        let round = self
            .backend
            .rounds
            .create(&self.room_code, topic, self.profile.id)
            .await?;
        self.channel
            .send(RoomEvent::RoundIdUpdate { round_id: round.id })
            .await?;
        self.channel.send(RoomEvent::TopicClosed).await?;
        Ok(round.id)
    }

    /// Non-drawer guess: the display echo goes out first, the durable
    /// upsert follows; a failed write retracts the echo with a notice.
    pub async fn submit_guess(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        let view = self.view();
        let SessionPhase::RoundActive { drawer } = view.phase else {
            return Err(SessionError::NoActiveRound);
        };
        if drawer == self.profile.id {
            return Err(SessionError::DrawerCannotGuess);
        }
        let Some(round) = view.current_round else {
            return Err(SessionError::NoActiveRound);
        };

        self.channel
            .send(RoomEvent::GuessAdded {
                profile: self.profile.id,
                text: text.clone(),
            })
            .await?;

        let guess = Guess {
            round,
            profile: self.profile.id,
            text,
            confidence: None,
        };
        if let Err(err) = self.backend.guesses.upsert(&guess).await {
            warn!(target = LOG_TARGET, round, error = %err, "durable guess write failed, retracting echo");
            let _ = self.inbox.push(Input::GuessRetracted {
                profile: self.profile.id,
            });
        }
        Ok(())
    }

    /// Drawer-only: appends a stroke to the durable log; peers receive it
    /// through the change feed.
    pub async fn submit_stroke(&self, path: StrokePath) -> Result<(), SessionError> {
        let view = self.view();
        let SessionPhase::RoundActive { drawer } = view.phase else {
            return Err(SessionError::NoActiveRound);
        };
        if drawer != self.profile.id {
            return Err(SessionError::NotDrawer);
        }
        let Some(round) = view.current_round else {
            return Err(SessionError::NoActiveRound);
        };
        self.backend.strokes.append(round, path).await?;
        Ok(())
    }

    pub async fn clear_canvas(&self) -> Result<(), SessionError> {
        if self.view().drawer() != Some(self.profile.id) {
            return Err(SessionError::NotDrawer);
        }
        self.channel.send(RoomEvent::CanvasClear).await?;
        Ok(())
    }

    /// Everything the review screen shows: the decided round, the final
    /// drawing's public URL, and the full guess list. Only meaningful once
    /// this client has reached the review phase.
    pub async fn review(&self) -> Result<ReviewSummary, SessionError> {
        let SessionPhase::Review { round } = self.view().phase else {
            return Err(SessionError::NoActiveRound);
        };
        let round = self.backend.rounds.get_by_id(round).await?;
        let guesses = self.backend.guesses.list_by_round(round.id).await?;
        let snapshot_url = self.backend.snapshots.public_url(&snapshot_key(round.id));
        Ok(ReviewSummary {
            round,
            snapshot_url,
            guesses,
        })
    }

    /// Review screen dismissed; back to the lobby.
    pub fn acknowledge_review(&self) {
        let _ = self.inbox.push(Input::ReviewAcknowledged);
    }

    /// Best-effort goodbye: membership deactivated, channel left, and the
    /// room deleted when this was the last active member. Peers treat the
    /// presence leave as the authoritative signal either way.
    pub async fn close(mut self) {
        if let Err(err) = self
            .backend
            .memberships
            .set_active(&self.room_code, self.profile.id, false)
            .await
        {
            warn!(target = LOG_TARGET, error = %err, "failed to deactivate membership on close");
        }
        self.channel.leave().await;

        match self.backend.memberships.list_active(&self.room_code).await {
            Ok(remaining) if remaining.is_empty() => {
                info!(target = LOG_TARGET, room = %self.room_code, "last member left, deleting room");
                if let Err(err) = self.backend.rooms.delete(&self.room_code).await {
                    warn!(target = LOG_TARGET, error = %err, "failed to delete empty room");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = LOG_TARGET, error = %err, "failed to check remaining members on close");
            }
        }

        self.stop.cancel();
        self.inbox.close();
        if let Some(handle) = self.driver.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
        self.inbox.close();
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

// ---- driver --------------------------------------------------------------

struct Driver {
    machine: RoomMachine,
    backend: Backend,
    channel: Arc<dyn RoomChannel>,
    workflow: Arc<DrawerWorkflow>,
    inbox: Arc<SessionInbox>,
    updates: watch::Sender<SessionView>,
    notices: Vec<String>,
    ticker: Option<JoinHandle<()>>,
    room_code: RoomCode,
    settle_delay: Duration,
}

impl Driver {
    async fn run(mut self, stop: CancellationToken) {
        loop {
            let receiver = self.inbox.pop();
            let input = tokio::select! {
                _ = stop.cancelled() => break,
                received = receiver => match received {
                    Ok(input) => input,
                    Err(_) => break,
                },
            };

            let disconnecting = matches!(input, Input::ChannelLost);
            let effects = self.machine.apply(input);
            for effect in effects {
                self.execute(effect).await;
            }
            self.publish();

            if disconnecting {
                break;
            }
        }
        self.stop_ticker();
    }

    fn publish(&mut self) {
        let mut view = self.machine.view();
        view.notices = self.notices.clone();
        let _ = self.updates.send(view);
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::SyncMember(profile) => self.sync_member(profile).await,
            Effect::MarkInactive(profile) => {
                if let Err(err) = self
                    .backend
                    .memberships
                    .set_active(&self.room_code, profile, false)
                    .await
                {
                    warn!(target = LOG_TARGET, %profile, error = %err, "failed to deactivate membership");
                }
            }
            Effect::RunHostFailover { departed } => self.run_host_failover(departed).await,
            Effect::FetchRound(round_id) => match self.backend.rounds.get_by_id(round_id).await {
                Ok(round) => {
                    let _ = self.inbox.push(Input::RoundLoaded { round });
                }
                Err(err) => {
                    warn!(target = LOG_TARGET, round_id, error = %err, "failed to fetch round record");
                }
            },
            Effect::StartCountdown => self.start_ticker(),
            Effect::StopCountdown => self.stop_ticker(),
            Effect::RunCheckpoint {
                round,
                topic,
                elapsed,
            } => self.spawn_checkpoint(round, topic, elapsed),
            Effect::FinishRound { round, topic } => self.spawn_finish(round, topic),
            Effect::TryFinalize {
                round,
                outcome,
                scorer,
            } => self.try_finalize(round, outcome, scorer).await,
            Effect::Notice(message) => {
                info!(target = LOG_TARGET, %message, "session notice");
                self.notices.push(message);
            }
        }
    }

    async fn sync_member(&mut self, profile: ProfileId) {
        let membership = match self.backend.memberships.fetch(&self.room_code, profile).await {
            Ok(Some(membership)) => membership,
            Ok(None) => {
                // Presence arrived ahead of the membership row; synthesize a
                // view entry and let a later sync fill it in.
                Membership {
                    room: self.room_code.clone(),
                    profile,
                    joined_at: Utc::now(),
                    score: 0,
                    is_active: true,
                }
            }
            Err(err) => {
                warn!(target = LOG_TARGET, %profile, error = %err, "failed to fetch membership");
                return;
            }
        };
        let loaded = match self.backend.profiles.fetch(profile).await {
            Ok(found) => found,
            Err(err) => {
                warn!(target = LOG_TARGET, %profile, error = %err, "failed to fetch profile");
                None
            }
        };
        let _ = self.inbox.push(Input::MemberLoaded {
            membership,
            profile: loaded,
        });
    }

    /// Cooperative host failover: earliest-joined remaining active member
    /// becomes host through a LWW upsert. Idempotent under concurrent
    /// execution by several observers; every writer picks the same
    /// successor from the same ordered query. A room that cannot get a
    /// host is torn down instead of being left headless.
    async fn run_host_failover(&mut self, departed: ProfileId) {
        let remaining = match self.backend.memberships.list_active(&self.room_code).await {
            Ok(list) => list,
            Err(err) => {
                warn!(target = LOG_TARGET, error = %err, "host failover could not list members");
                self.notices.push("Host change failed".into());
                return;
            }
        };
        let successor = remaining.into_iter().find(|m| m.profile != departed);

        match successor {
            Some(next) => {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    match self.backend.rooms.set_host(&self.room_code, next.profile).await {
                        Ok(()) => {
                            info!(target = LOG_TARGET, new_host = %next.profile, "host failover complete");
                            if let Some(room) = self.machine.room() {
                                let mut updated = room.clone();
                                updated.host = next.profile;
                                let _ = self.inbox.push(Input::RoomChanged { room: updated });
                            }
                            break;
                        }
                        Err(err) if attempts == 1 => {
                            warn!(target = LOG_TARGET, error = %err, "host failover write failed, retrying");
                        }
                        Err(err) => {
                            warn!(target = LOG_TARGET, error = %err, "host failover failed twice, tearing room down");
                            let _ = self.backend.rooms.delete(&self.room_code).await;
                            self.notices.push("The room lost its host and was closed".into());
                            break;
                        }
                    }
                }
            }
            None => {
                info!(target = LOG_TARGET, room = %self.room_code, "no active members remain, deleting room");
                if let Err(err) = self.backend.rooms.delete(&self.room_code).await {
                    warn!(target = LOG_TARGET, error = %err, "failed to delete empty room");
                }
            }
        }
    }

    /// First-decided-wins write. Only the client whose conditional write
    /// actually decided the round applies the score award, so concurrent
    /// observers cannot double-score.
    async fn try_finalize(
        &mut self,
        round: RoundId,
        outcome: RoundOutcome,
        scorer: Option<ProfileId>,
    ) {
        let decided_now = match self.backend.rounds.set_outcome(round, outcome).await {
            Ok(decided) => decided,
            Err(err) => {
                warn!(target = LOG_TARGET, round, error = %err, "outcome finalization failed");
                return;
            }
        };
        if !decided_now {
            return;
        }
        info!(target = LOG_TARGET, round, ?outcome, "round outcome finalized");

        let Some(winner) = scorer else {
            return;
        };
        let award = self.machine.cfg().guesser_award;
        match self.backend.memberships.fetch(&self.room_code, winner).await {
            Ok(Some(mut membership)) => {
                membership.score += award;
                if let Err(err) = self.backend.memberships.upsert(&membership).await {
                    warn!(target = LOG_TARGET, %winner, error = %err, "failed to award score");
                } else {
                    let _ = self.inbox.push(Input::MemberLoaded {
                        membership,
                        profile: None,
                    });
                }
            }
            Ok(None) => {
                warn!(target = LOG_TARGET, %winner, "winning guesser has no membership row");
            }
            Err(err) => {
                warn!(target = LOG_TARGET, %winner, error = %err, "failed to load winner membership");
            }
        }
    }

    fn spawn_checkpoint(&self, round: RoundId, topic: TopicId, elapsed: u32) {
        let Some(text) = topic_text(topic) else {
            warn!(target = LOG_TARGET, topic, "unknown topic, skipping checkpoint");
            return;
        };
        let workflow = Arc::clone(&self.workflow);
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            match workflow.checkpoint(round, text).await {
                Ok(event) => {
                    if let Err(err) = channel.send(event).await {
                        warn!(target = LOG_TARGET, round, error = %err, "failed to broadcast prediction update");
                    }
                }
                Err(err) => {
                    // The round continues without this checkpoint's update.
                    warn!(target = LOG_TARGET, round, elapsed, error = %err, "prediction checkpoint skipped");
                }
            }
        });
    }

    fn spawn_finish(&self, round: RoundId, topic: TopicId) {
        let Some(text) = topic_text(topic) else {
            warn!(target = LOG_TARGET, topic, "unknown topic, ending round without prediction");
            let channel = Arc::clone(&self.channel);
            tokio::spawn(async move {
                let _ = channel.send(RoomEvent::RoundEnds { round_id: round }).await;
            });
            return;
        };
        let workflow = Arc::clone(&self.workflow);
        let channel = Arc::clone(&self.channel);
        let settle = self.settle_delay;
        tokio::spawn(async move {
            let finish = workflow.finish(round, text).await;
            if let Some(event) = finish.prediction {
                if let Err(err) = channel.send(event).await {
                    warn!(target = LOG_TARGET, round, error = %err, "failed to broadcast final prediction");
                }
            }
            // Let the final stroke and guess writes fan out before review.
            tokio::time::sleep(settle).await;
            if let Err(err) = channel.send(RoomEvent::RoundEnds { round_id: round }).await {
                warn!(target = LOG_TARGET, round, error = %err, "failed to broadcast round end");
            }
        });
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();
        let inbox = Arc::clone(&self.inbox);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if inbox.push(Input::Tick).is_err() {
                    break;
                }
            }
        });
        self.ticker = Some(handle);
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}
