//! Per-room presence/broadcast channel. One subscription per joined room;
//! everything the transport surfaces (presence snapshots and diffs,
//! broadcast events, change-feed rows) is normalized into one ordered
//! message stream the session consumes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{ProfileId, Room, RoomCode, StrokeEvent};
use crate::events::RoomEvent;

pub mod local;
pub mod supabase;

pub use local::LocalHub;
pub use supabase::{SupabaseChannelConfig, SupabaseChannelFactory};

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    /// Full presence snapshot: the identifiers currently tracked on the
    /// topic. Set semantics; duplicates already collapsed by key.
    PresenceSync { members: Vec<ProfileId> },
    PresenceJoin { profile: ProfileId },
    /// Authoritative disconnect signal; there is no reliable goodbye
    /// message.
    PresenceLeave { profile: ProfileId },
    /// A fanned-out broadcast, the sender's own included.
    Broadcast(RoomEvent),
    /// Change-feed notification on the room row (host, active flag).
    RoomChanged(Room),
    /// Change-feed notification of an appended stroke.
    StrokeAppended(StrokeEvent),
    /// The transport dropped; no further messages will arrive.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait RoomChannel: Send + Sync {
    /// Registers the local profile under its presence key. Peers observe a
    /// join.
    async fn track(&self, profile: ProfileId) -> Result<(), ChannelError>;

    /// Fire-and-forget broadcast to every subscriber, self included.
    async fn send(&self, event: RoomEvent) -> Result<(), ChannelError>;

    /// Best-effort goodbye; peers learn of the departure through presence.
    async fn leave(&self);
}

/// An open room subscription: the control half plus the ordered inbox.
pub struct Subscription {
    pub channel: Arc<dyn RoomChannel>,
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn join(
        &self,
        room: &RoomCode,
        presence_key: ProfileId,
    ) -> Result<Subscription, ChannelError>;
}
