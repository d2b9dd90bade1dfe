//! The room state machine. Pure: consumes one input at a time, mutates the
//! local view, and returns effects for the driver to execute. All I/O and
//! timing lives outside, which is what keeps multi-client behavior testable
//! without a transport.
//!
//! Inputs arrive with at-least-once semantics and no cross-type ordering,
//! so every transition tolerates duplicates and both orders of racing
//! messages (a round-begins broadcast and the round row fetch, a presence
//! join and its membership row, and so on).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::GameConfig;
use crate::domain::{
    Membership, Profile, ProfileId, Room, Round, RoundId, RoundOutcome, StrokeEvent, TopicId,
    MODEL_PROFILE_ID,
};
use crate::events::RoomEvent;
use crate::round::checkpoints::CheckpointSchedule;
use crate::round::scoring::{closeness_bucket, guess_takes_round, model_takes_round};

const LOG_TARGET: &str = "session::state";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Joining,
    Lobby,
    RoundSetup { drawer: ProfileId },
    RoundActive { drawer: ProfileId },
    RoundEnding,
    Review { round: RoundId },
}

/// What the machine knows about one member. Presence is authoritative for
/// the active flag; the membership row fills in the rest when it loads.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberEntry {
    pub profile: ProfileId,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub score: i64,
    pub is_active: bool,
}

impl MemberEntry {
    fn placeholder(profile: ProfileId) -> Self {
        Self {
            profile,
            name: None,
            avatar: None,
            joined_at: None,
            score: 0,
            is_active: true,
        }
    }
}

/// One line of the shared guess transcript; at most one per profile, the
/// model's included.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptLine {
    pub profile: ProfileId,
    pub text: String,
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug)]
pub enum Input {
    /// Join handshake finished; initial room snapshot.
    Joined { room: Room },
    PresenceSync { members: Vec<ProfileId> },
    PresenceJoin { profile: ProfileId },
    PresenceLeave { profile: ProfileId },
    /// A fanned-out broadcast, our own included.
    Event(RoomEvent),
    RoomChanged { room: Room },
    StrokeAppended { stroke: StrokeEvent },
    /// Authoritative round row, fetched after a round-id broadcast.
    RoundLoaded { round: Round },
    /// Membership row (and profile, when it exists) for a presence key.
    MemberLoaded {
        membership: Membership,
        profile: Option<Profile>,
    },
    /// The durable write behind an optimistic guess echo failed.
    GuessRetracted { profile: ProfileId },
    /// One second of countdown elapsed.
    Tick,
    ReviewAcknowledged,
    ChannelLost,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Fetch membership + profile for a presence key we cannot place yet.
    SyncMember(ProfileId),
    /// Persist the inactive flag for a departed member.
    MarkInactive(ProfileId),
    /// The departed member was the host; run the cooperative failover.
    RunHostFailover { departed: ProfileId },
    FetchRound(RoundId),
    StartCountdown,
    StopCountdown,
    /// Drawer only: run one prediction checkpoint.
    RunCheckpoint {
        round: RoundId,
        topic: TopicId,
        elapsed: u32,
    },
    /// Drawer only: the countdown hit zero.
    FinishRound { round: RoundId, topic: TopicId },
    /// First-decided-wins outcome write; `scorer` names the member to award
    /// when the write actually decides the round.
    TryFinalize {
        round: RoundId,
        outcome: RoundOutcome,
        scorer: Option<ProfileId>,
    },
    /// Non-fatal, user-visible condition.
    Notice(String),
}

pub struct RoomMachine {
    cfg: GameConfig,
    local: ProfileId,
    phase: SessionPhase,
    room: Option<Room>,
    members: BTreeMap<ProfileId, MemberEntry>,
    current_round: Option<RoundId>,
    current_topic: Option<TopicId>,
    drawer: Option<ProfileId>,
    round_duration: u32,
    remaining_secs: u32,
    checkpoints: CheckpointSchedule,
    transcript: Vec<TranscriptLine>,
    strokes: Vec<StrokeEvent>,
    outcome: RoundOutcome,
    closeness: f64,
}

impl RoomMachine {
    pub fn new(cfg: GameConfig, local: ProfileId) -> Self {
        let checkpoints = CheckpointSchedule::new(cfg.prediction_checkpoints.clone());
        let round_duration = cfg.round_duration_secs();
        Self {
            cfg,
            local,
            phase: SessionPhase::Disconnected,
            room: None,
            members: BTreeMap::new(),
            current_round: None,
            current_topic: None,
            drawer: None,
            round_duration,
            remaining_secs: 0,
            checkpoints,
            transcript: Vec::new(),
            strokes: Vec::new(),
            outcome: RoundOutcome::Undecided,
            closeness: 0.0,
        }
    }

    pub fn begin_join(&mut self) {
        self.phase = SessionPhase::Joining;
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn local(&self) -> ProfileId {
        self.local
    }

    pub fn is_host(&self) -> bool {
        self.room
            .as_ref()
            .map(|room| room.host == self.local)
            .unwrap_or(false)
    }

    pub fn active_member_count(&self) -> usize {
        self.members.values().filter(|m| m.is_active).count()
    }

    pub fn current_round(&self) -> Option<RoundId> {
        self.current_round
    }

    pub fn current_topic(&self) -> Option<TopicId> {
        self.current_topic
    }

    pub fn view(&self) -> SessionView {
        let mut members: Vec<MemberEntry> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.profile.cmp(&b.profile)));
        SessionView {
            phase: self.phase.clone(),
            room: self.room.clone(),
            members,
            transcript: self.transcript.clone(),
            strokes: self.strokes.clone(),
            remaining_secs: self.remaining_secs,
            closeness: self.closeness,
            outcome: self.outcome,
            current_round: self.current_round,
            current_topic: self.current_topic,
            notices: Vec::new(),
        }
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Joined { room } => self.on_joined(room),
            Input::PresenceSync { members } => self.on_presence_sync(members),
            Input::PresenceJoin { profile } => self.on_presence_join(profile),
            Input::PresenceLeave { profile } => self.on_presence_leave(profile),
            Input::Event(event) => self.on_event(event),
            Input::RoomChanged { room } => self.on_room_changed(room),
            Input::StrokeAppended { stroke } => self.on_stroke(stroke),
            Input::RoundLoaded { round } => self.on_round_loaded(round),
            Input::MemberLoaded {
                membership,
                profile,
            } => self.on_member_loaded(membership, profile),
            Input::GuessRetracted { profile } => self.on_guess_retracted(profile),
            Input::Tick => self.on_tick(),
            Input::ReviewAcknowledged => self.on_review_acknowledged(),
            Input::ChannelLost => self.on_channel_lost(),
        }
    }

    fn on_joined(&mut self, room: Room) -> Vec<Effect> {
        if room.round_duration_secs > 0 {
            self.round_duration = room.round_duration_secs;
        }
        self.room = Some(room);
        self.phase = SessionPhase::Lobby;
        Vec::new()
    }

    /// Full presence snapshot: set semantics keyed by profile id. Known
    /// members flip active flags; unknown ids become placeholders until
    /// their membership row loads.
    fn on_presence_sync(&mut self, present: Vec<ProfileId>) -> Vec<Effect> {
        let mut effects = Vec::new();

        for member in self.members.values_mut() {
            member.is_active = present.contains(&member.profile);
        }
        for profile in present {
            if !self.members.contains_key(&profile) {
                self.members.insert(profile, MemberEntry::placeholder(profile));
                effects.push(Effect::SyncMember(profile));
            }
        }
        effects
    }

    fn on_presence_join(&mut self, profile: ProfileId) -> Vec<Effect> {
        match self.members.get_mut(&profile) {
            Some(entry) => {
                entry.is_active = true;
                if entry.name.is_none() {
                    vec![Effect::SyncMember(profile)]
                } else {
                    Vec::new()
                }
            }
            None => {
                self.members.insert(profile, MemberEntry::placeholder(profile));
                vec![Effect::SyncMember(profile)]
            }
        }
    }

    fn on_presence_leave(&mut self, profile: ProfileId) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(entry) = self.members.get_mut(&profile) {
            entry.is_active = false;
        }
        effects.push(Effect::MarkInactive(profile));

        if self.room.as_ref().map(|room| room.host) == Some(profile) {
            effects.push(Effect::RunHostFailover { departed: profile });
        }

        // A round without its drawer can never end; abandon it rather than
        // leaving every guesser stuck at a frozen countdown.
        if self.drawer == Some(profile)
            && matches!(
                self.phase,
                SessionPhase::RoundSetup { .. } | SessionPhase::RoundActive { .. }
            )
        {
            self.reset_round_state();
            self.phase = SessionPhase::Lobby;
            effects.push(Effect::StopCountdown);
            effects.push(Effect::Notice("The drawer left; round abandoned".into()));
        }

        effects
    }

    fn on_event(&mut self, event: RoomEvent) -> Vec<Effect> {
        match event {
            RoomEvent::OpenTopicDialog { drawer } => {
                if !matches!(self.phase, SessionPhase::Lobby) {
                    debug!(target = LOG_TARGET, ?drawer, "ignoring open-topic-dialog outside lobby");
                    return Vec::new();
                }
                self.reset_round_state();
                self.drawer = Some(drawer);
                self.phase = SessionPhase::RoundSetup { drawer };
                Vec::new()
            }
            RoomEvent::RoundIdUpdate { round_id } => {
                if !matches!(
                    self.phase,
                    SessionPhase::RoundSetup { .. } | SessionPhase::RoundActive { .. }
                ) {
                    return Vec::new();
                }
                self.current_round = Some(round_id);
                vec![Effect::FetchRound(round_id)]
            }
            RoomEvent::TopicClosed => {
                let SessionPhase::RoundSetup { drawer } = self.phase else {
                    return Vec::new();
                };
                self.phase = SessionPhase::RoundActive { drawer };
                self.remaining_secs = self.round_duration;
                self.checkpoints.reset();
                vec![Effect::StartCountdown]
            }
            RoomEvent::GuessAdded { profile, text } => self.on_guess(profile, text),
            RoomEvent::PredictionUpdate {
                label,
                confidence,
                similarity,
            } => self.on_prediction(label, confidence, similarity),
            RoomEvent::RoundEnds { round_id } => {
                self.current_round.get_or_insert(round_id);
                self.phase = SessionPhase::Review { round: round_id };
                vec![Effect::StopCountdown]
            }
            RoomEvent::CanvasClear => {
                self.strokes.clear();
                Vec::new()
            }
        }
    }

    fn on_guess(&mut self, profile: ProfileId, text: String) -> Vec<Effect> {
        self.upsert_transcript(profile, text.clone(), None);

        if self.outcome.is_decided() {
            return Vec::new();
        }
        let Some(topic_text) = self.topic_text() else {
            return Vec::new();
        };
        if !guess_takes_round(&text, topic_text) {
            return Vec::new();
        }

        self.outcome = RoundOutcome::GuessersWin;
        match self.current_round {
            Some(round) => vec![Effect::TryFinalize {
                round,
                outcome: RoundOutcome::GuessersWin,
                scorer: Some(profile),
            }],
            None => Vec::new(),
        }
    }

    fn on_prediction(&mut self, label: String, confidence: f64, similarity: f64) -> Vec<Effect> {
        self.closeness = closeness_bucket(similarity);
        self.upsert_transcript(MODEL_PROFILE_ID, label.clone(), Some(confidence));

        if self.outcome.is_decided() {
            return Vec::new();
        }
        let Some(topic_text) = self.topic_text() else {
            return Vec::new();
        };
        if !model_takes_round(&label, similarity, topic_text) {
            return Vec::new();
        }

        self.outcome = RoundOutcome::ModelWins;
        match self.current_round {
            Some(round) => vec![Effect::TryFinalize {
                round,
                outcome: RoundOutcome::ModelWins,
                scorer: None,
            }],
            None => Vec::new(),
        }
    }

    fn on_room_changed(&mut self, room: Room) -> Vec<Effect> {
        if room.round_duration_secs > 0 {
            self.round_duration = room.round_duration_secs;
        }
        let host_changed = self
            .room
            .as_ref()
            .map(|known| known.host != room.host)
            .unwrap_or(false);
        self.room = Some(room);
        if host_changed {
            vec![Effect::Notice("A new host was chosen".into())]
        } else {
            Vec::new()
        }
    }

    fn on_stroke(&mut self, stroke: StrokeEvent) -> Vec<Effect> {
        // Change notifications are at-least-once and the stroke
        // subscription is table-wide; drop foreign rounds and replays.
        if let Some(round) = self.current_round {
            if stroke.round != round {
                return Vec::new();
            }
        }
        if self
            .strokes
            .iter()
            .any(|known| known.round == stroke.round && known.seq == stroke.seq)
        {
            return Vec::new();
        }
        self.strokes.push(stroke);
        Vec::new()
    }

    fn on_round_loaded(&mut self, round: Round) -> Vec<Effect> {
        self.current_round = Some(round.id);
        self.current_topic = Some(round.topic);
        self.drawer = Some(round.drawer);
        if round.outcome.is_decided() {
            self.outcome = round.outcome;
        }
        Vec::new()
    }

    fn on_member_loaded(
        &mut self,
        membership: Membership,
        profile: Option<Profile>,
    ) -> Vec<Effect> {
        let entry = self
            .members
            .entry(membership.profile)
            .or_insert_with(|| MemberEntry::placeholder(membership.profile));
        entry.joined_at = Some(membership.joined_at);
        entry.score = membership.score;
        if let Some(profile) = profile {
            entry.name = Some(profile.name);
            entry.avatar = Some(profile.avatar);
        }
        // Presence stays authoritative for the active flag; the row may lag.
        Vec::new()
    }

    fn on_guess_retracted(&mut self, profile: ProfileId) -> Vec<Effect> {
        self.transcript.retain(|line| line.profile != profile);
        vec![Effect::Notice("Your guess could not be saved".into())]
    }

    fn on_tick(&mut self) -> Vec<Effect> {
        let SessionPhase::RoundActive { drawer } = self.phase else {
            return Vec::new();
        };
        if self.remaining_secs == 0 {
            return Vec::new();
        }
        self.remaining_secs -= 1;
        let elapsed = self.round_duration - self.remaining_secs;

        let mut effects = Vec::new();
        let is_drawer = drawer == self.local;

        if is_drawer {
            if let (Some(round), Some(topic)) = (self.current_round, self.current_topic) {
                for mark in self.checkpoints.due(elapsed) {
                    effects.push(Effect::RunCheckpoint {
                        round,
                        topic,
                        elapsed: mark,
                    });
                }
            }
        }

        if self.remaining_secs == 0 {
            self.phase = SessionPhase::RoundEnding;
            effects.push(Effect::StopCountdown);
            // Only the drawer's clock is authoritative for ending the round.
            if is_drawer {
                if let (Some(round), Some(topic)) = (self.current_round, self.current_topic) {
                    effects.push(Effect::FinishRound { round, topic });
                } else {
                    effects.push(Effect::Notice(
                        "Round record never arrived; returning to lobby".into(),
                    ));
                    self.phase = SessionPhase::Lobby;
                }
            }
        }

        effects
    }

    fn on_review_acknowledged(&mut self) -> Vec<Effect> {
        if matches!(self.phase, SessionPhase::Review { .. }) {
            self.phase = SessionPhase::Lobby;
        }
        Vec::new()
    }

    fn on_channel_lost(&mut self) -> Vec<Effect> {
        self.phase = SessionPhase::Disconnected;
        vec![
            Effect::StopCountdown,
            Effect::Notice("Connection to the room was lost".into()),
        ]
    }

    fn reset_round_state(&mut self) {
        self.current_round = None;
        self.current_topic = None;
        self.drawer = None;
        self.remaining_secs = 0;
        self.checkpoints.reset();
        self.transcript.clear();
        self.strokes.clear();
        self.outcome = RoundOutcome::Undecided;
        self.closeness = 0.0;
    }

    fn topic_text(&self) -> Option<&'static str> {
        self.current_topic.and_then(crate::domain::topic_text)
    }

    fn upsert_transcript(&mut self, profile: ProfileId, text: String, confidence: Option<f64>) {
        match self
            .transcript
            .iter_mut()
            .find(|line| line.profile == profile)
        {
            Some(line) => {
                line.text = text;
                line.confidence = confidence;
            }
            None => self.transcript.push(TranscriptLine {
                profile,
                text,
                confidence,
            }),
        }
    }

    pub fn cfg(&self) -> &GameConfig {
        &self.cfg
    }
}

/// Cheap snapshot of the machine for the presentation layer. Published
/// after every consumed input.
#[derive(Clone, Debug)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub room: Option<Room>,
    pub members: Vec<MemberEntry>,
    pub transcript: Vec<TranscriptLine>,
    pub strokes: Vec<StrokeEvent>,
    pub remaining_secs: u32,
    pub closeness: f64,
    pub outcome: RoundOutcome,
    pub current_round: Option<RoundId>,
    pub current_topic: Option<TopicId>,
    pub notices: Vec<String>,
}

impl SessionView {
    pub fn is_host_profile(&self, profile: ProfileId) -> bool {
        self.room
            .as_ref()
            .map(|room| room.host == profile)
            .unwrap_or(false)
    }

    pub fn active_member_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_active).count()
    }

    pub fn drawer(&self) -> Option<ProfileId> {
        match self.phase {
            SessionPhase::RoundSetup { drawer } | SessionPhase::RoundActive { drawer } => {
                Some(drawer)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::domain::RoomCode;

    use super::*;

    fn room(code: &str, host: ProfileId) -> Room {
        Room {
            code: RoomCode::parse(code).unwrap(),
            host,
            is_active: false,
            round_duration_secs: 45,
            created_at: Utc::now(),
        }
    }

    fn joined_machine(local: ProfileId, host: ProfileId) -> RoomMachine {
        let mut machine = RoomMachine::new(GameConfig::default(), local);
        machine.begin_join();
        machine.apply(Input::Joined {
            room: room("ABCD", host),
        });
        machine
    }

    fn sample_round(id: RoundId, drawer: ProfileId) -> Round {
        Round {
            id,
            room: RoomCode::parse("ABCD").unwrap(),
            round_no: 1,
            topic: 1, // "banana"
            drawer,
            outcome: RoundOutcome::Undecided,
            started_at: Utc::now(),
        }
    }

    /// Drives a machine from lobby into an active round with a loaded
    /// round record.
    fn start_round(machine: &mut RoomMachine, drawer: ProfileId, round_id: RoundId) {
        machine.apply(Input::Event(RoomEvent::OpenTopicDialog { drawer }));
        machine.apply(Input::Event(RoomEvent::RoundIdUpdate { round_id }));
        machine.apply(Input::RoundLoaded {
            round: sample_round(round_id, drawer),
        });
        machine.apply(Input::Event(RoomEvent::TopicClosed));
    }

    #[test]
    fn duplicate_presence_joins_collapse_to_one_member() {
        let local = Uuid::new_v4();
        let host = Uuid::new_v4();
        let mut machine = joined_machine(local, host);

        let peer = Uuid::new_v4();
        for _ in 0..4 {
            machine.apply(Input::PresenceJoin { profile: peer });
        }
        machine.apply(Input::PresenceSync {
            members: vec![peer, peer, local],
        });

        assert_eq!(machine.active_member_count(), 2);
        assert_eq!(machine.view().members.len(), 2);
    }

    #[test]
    fn presence_sync_deactivates_absent_members() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        let peer = Uuid::new_v4();
        machine.apply(Input::PresenceJoin { profile: peer });
        machine.apply(Input::PresenceJoin { profile: local });

        machine.apply(Input::PresenceSync {
            members: vec![local],
        });
        assert_eq!(machine.active_member_count(), 1);

        // Rejoin reactivates the same entry.
        machine.apply(Input::PresenceJoin { profile: peer });
        assert_eq!(machine.active_member_count(), 2);
        assert_eq!(machine.view().members.len(), 2);
    }

    #[test]
    fn host_leave_triggers_failover_effect() {
        let local = Uuid::new_v4();
        let host = Uuid::new_v4();
        let mut machine = joined_machine(local, host);
        machine.apply(Input::PresenceJoin { profile: host });
        machine.apply(Input::PresenceJoin { profile: local });

        let effects = machine.apply(Input::PresenceLeave { profile: host });
        assert!(effects.contains(&Effect::MarkInactive(host)));
        assert!(effects.contains(&Effect::RunHostFailover { departed: host }));
    }

    #[test]
    fn non_host_leave_does_not_trigger_failover() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        let peer = Uuid::new_v4();
        machine.apply(Input::PresenceJoin { profile: peer });

        let effects = machine.apply(Input::PresenceLeave { profile: peer });
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::RunHostFailover { .. })));
    }

    #[test]
    fn open_topic_dialog_enters_setup_and_topic_closed_starts_countdown() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);

        machine.apply(Input::Event(RoomEvent::OpenTopicDialog { drawer: local }));
        assert_eq!(*machine.phase(), SessionPhase::RoundSetup { drawer: local });

        let effects = machine.apply(Input::Event(RoomEvent::TopicClosed));
        assert_eq!(*machine.phase(), SessionPhase::RoundActive { drawer: local });
        assert!(effects.contains(&Effect::StartCountdown));
        assert_eq!(machine.view().remaining_secs, 45);

        // A duplicate topic-closed delivery is a no-op.
        let effects = machine.apply(Input::Event(RoomEvent::TopicClosed));
        assert!(effects.is_empty());
    }

    #[test]
    fn round_id_update_requests_authoritative_fetch() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        machine.apply(Input::Event(RoomEvent::OpenTopicDialog { drawer: local }));

        let effects = machine.apply(Input::Event(RoomEvent::RoundIdUpdate { round_id: 9 }));
        assert_eq!(effects, vec![Effect::FetchRound(9)]);
        assert_eq!(machine.current_round(), Some(9));
    }

    #[test]
    fn matching_guess_decides_for_guessers_and_later_prediction_cannot_flip_it() {
        let local = Uuid::new_v4();
        let guesser = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        let effects = machine.apply(Input::Event(RoomEvent::GuessAdded {
            profile: guesser,
            text: "BANANA".into(),
        }));
        assert_eq!(
            effects,
            vec![Effect::TryFinalize {
                round: 5,
                outcome: RoundOutcome::GuessersWin,
                scorer: Some(guesser),
            }]
        );
        assert_eq!(machine.view().outcome, RoundOutcome::GuessersWin);

        // A perfect similarity score arriving afterwards must not flip it.
        let effects = machine.apply(Input::Event(RoomEvent::PredictionUpdate {
            label: "something".into(),
            confidence: 0.9,
            similarity: 1.0,
        }));
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::TryFinalize { .. })));
        assert_eq!(machine.view().outcome, RoundOutcome::GuessersWin);
    }

    #[test]
    fn prediction_updates_move_the_closeness_bucket() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        for (similarity, bucket) in [(0.2, 0.4), (0.55, 0.6), (0.7, 0.85), (0.9, 1.0)] {
            machine.apply(Input::Event(RoomEvent::PredictionUpdate {
                label: "fruit".into(),
                confidence: 0.5,
                similarity,
            }));
            assert_eq!(machine.view().closeness, bucket);
        }
        // 0.9 never matched the model-wins rule, so the round is still open.
        assert_eq!(machine.view().outcome, RoundOutcome::Undecided);
    }

    #[test]
    fn model_label_match_decides_for_the_model() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        let effects = machine.apply(Input::Event(RoomEvent::PredictionUpdate {
            label: "Banana".into(),
            confidence: 0.8,
            similarity: 0.7,
        }));
        assert_eq!(
            effects,
            vec![Effect::TryFinalize {
                round: 5,
                outcome: RoundOutcome::ModelWins,
                scorer: None,
            }]
        );
    }

    #[test]
    fn drawer_ticks_fire_checkpoints_once_and_finish_the_round() {
        let local = Uuid::new_v4();
        let mut machine = RoomMachine::new(
            GameConfig {
                round_duration: std::time::Duration::from_secs(4),
                prediction_checkpoints: vec![2],
                ..GameConfig::default()
            },
            local,
        );
        machine.begin_join();
        let mut joined = room("ABCD", local);
        joined.round_duration_secs = 4;
        machine.apply(Input::Joined { room: joined });
        start_round(&mut machine, local, 5);

        assert!(machine.apply(Input::Tick).is_empty()); // elapsed 1
        let effects = machine.apply(Input::Tick); // elapsed 2
        assert_eq!(
            effects,
            vec![Effect::RunCheckpoint {
                round: 5,
                topic: 1,
                elapsed: 2,
            }]
        );
        assert!(machine.apply(Input::Tick).is_empty()); // elapsed 3

        let effects = machine.apply(Input::Tick); // elapsed 4 → zero remaining
        assert_eq!(*machine.phase(), SessionPhase::RoundEnding);
        assert!(effects.contains(&Effect::StopCountdown));
        assert!(effects.contains(&Effect::FinishRound { round: 5, topic: 1 }));
    }

    #[test]
    fn guesser_ticks_never_finish_the_round() {
        let local = Uuid::new_v4();
        let drawer = Uuid::new_v4();
        let mut machine = RoomMachine::new(
            GameConfig {
                round_duration: std::time::Duration::from_secs(2),
                prediction_checkpoints: vec![1],
                ..GameConfig::default()
            },
            local,
        );
        machine.begin_join();
        let mut joined = room("ABCD", drawer);
        joined.round_duration_secs = 2;
        machine.apply(Input::Joined { room: joined });
        start_round(&mut machine, drawer, 5);

        assert!(machine.apply(Input::Tick).is_empty());
        let effects = machine.apply(Input::Tick);
        assert_eq!(*machine.phase(), SessionPhase::RoundEnding);
        assert_eq!(effects, vec![Effect::StopCountdown]);
    }

    #[test]
    fn round_ends_navigates_to_review_and_ack_returns_to_lobby() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        let effects = machine.apply(Input::Event(RoomEvent::RoundEnds { round_id: 5 }));
        assert_eq!(*machine.phase(), SessionPhase::Review { round: 5 });
        assert!(effects.contains(&Effect::StopCountdown));

        machine.apply(Input::ReviewAcknowledged);
        assert_eq!(*machine.phase(), SessionPhase::Lobby);
    }

    #[test]
    fn drawer_departure_abandons_the_round() {
        let local = Uuid::new_v4();
        let drawer = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        machine.apply(Input::PresenceJoin { profile: drawer });
        start_round(&mut machine, drawer, 5);

        let effects = machine.apply(Input::PresenceLeave { profile: drawer });
        assert_eq!(*machine.phase(), SessionPhase::Lobby);
        assert!(effects.contains(&Effect::StopCountdown));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notice(_))));
    }

    #[test]
    fn duplicate_strokes_are_dropped_and_foreign_rounds_ignored() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        let stroke = StrokeEvent {
            round: 5,
            seq: 1,
            path: crate::domain::StrokePath {
                points: vec![[0.0, 0.0]],
                is_eraser: false,
            },
        };
        machine.apply(Input::StrokeAppended {
            stroke: stroke.clone(),
        });
        machine.apply(Input::StrokeAppended {
            stroke: stroke.clone(),
        });
        machine.apply(Input::StrokeAppended {
            stroke: StrokeEvent {
                round: 99,
                ..stroke.clone()
            },
        });
        assert_eq!(machine.view().strokes.len(), 1);

        machine.apply(Input::Event(RoomEvent::CanvasClear));
        assert!(machine.view().strokes.is_empty());
    }

    #[test]
    fn guess_retraction_removes_the_echo() {
        let local = Uuid::new_v4();
        let guesser = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        machine.apply(Input::Event(RoomEvent::GuessAdded {
            profile: guesser,
            text: "pear".into(),
        }));
        assert_eq!(machine.view().transcript.len(), 1);

        let effects = machine.apply(Input::GuessRetracted { profile: guesser });
        assert!(machine.view().transcript.is_empty());
        assert!(effects.iter().any(|e| matches!(e, Effect::Notice(_))));
    }

    #[test]
    fn channel_loss_disconnects() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        start_round(&mut machine, local, 5);

        let effects = machine.apply(Input::ChannelLost);
        assert_eq!(*machine.phase(), SessionPhase::Disconnected);
        assert!(effects.contains(&Effect::StopCountdown));
    }

    #[test]
    fn round_loaded_is_authoritative_for_topic_and_outcome() {
        let local = Uuid::new_v4();
        let mut machine = joined_machine(local, local);
        machine.apply(Input::Event(RoomEvent::OpenTopicDialog { drawer: local }));

        let mut decided = sample_round(5, local);
        decided.outcome = RoundOutcome::ModelWins;
        machine.apply(Input::RoundLoaded { round: decided });

        assert_eq!(machine.current_topic(), Some(1));
        assert_eq!(machine.view().outcome, RoundOutcome::ModelWins);
    }
}
