//! In-process channel fabric. Fans presence, broadcast, and change-feed
//! messages out to every subscriber of a room topic, mimicking the hosted
//! transport closely enough to run multi-client scenarios in one process:
//! broadcasts echo back to the sender, presence joins/leaves reach everyone,
//! and a presence sync snapshot follows every diff.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::domain::{ProfileId, Room, RoomCode, StrokeEvent};
use crate::events::RoomEvent;
use crate::stores::memory::InMemoryBackend;

use super::{ChannelError, ChannelFactory, ChannelMessage, RoomChannel, Subscription};

const LOG_TARGET: &str = "channel::local";

struct Peer {
    key: ProfileId,
    tracked: bool,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Default)]
struct TopicState {
    next_id: u64,
    peers: HashMap<u64, Peer>,
}

impl TopicState {
    fn tracked_keys(&self) -> Vec<ProfileId> {
        let mut keys: Vec<ProfileId> = self
            .peers
            .values()
            .filter(|peer| peer.tracked)
            .map(|peer| peer.key)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn fan_out(&self, message: &ChannelMessage) {
        for peer in self.peers.values() {
            let _ = peer.tx.send(message.clone());
        }
    }
}

#[derive(Default)]
pub struct LocalHub {
    topics: DashMap<String, TopicState>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replays an in-memory backend's change feeds onto the given room
    /// topic, standing in for the platform's change-data-capture stream.
    pub fn wire_change_feeds(
        self: &Arc<Self>,
        room: &RoomCode,
        backend: &Arc<InMemoryBackend>,
    ) -> Vec<JoinHandle<()>> {
        let topic = room.channel_topic();

        let hub = Arc::clone(self);
        let mut rooms = BroadcastStream::new(backend.room_feed());
        let room_topic = topic.clone();
        let room_forwarder = tokio::spawn(async move {
            while let Some(item) = rooms.next().await {
                if let Ok(updated) = item {
                    hub.publish_room(&room_topic, updated);
                }
            }
        });

        let hub = Arc::clone(self);
        let mut strokes = BroadcastStream::new(backend.stroke_feed());
        let stroke_forwarder = tokio::spawn(async move {
            while let Some(item) = strokes.next().await {
                if let Ok(stroke) = item {
                    hub.publish_stroke(&topic, stroke);
                }
            }
        });

        vec![room_forwarder, stroke_forwarder]
    }

    pub fn publish_room(&self, topic: &str, room: Room) {
        if let Some(state) = self.topics.get(topic) {
            state.fan_out(&ChannelMessage::RoomChanged(room));
        }
    }

    pub fn publish_stroke(&self, topic: &str, stroke: StrokeEvent) {
        if let Some(state) = self.topics.get(topic) {
            state.fan_out(&ChannelMessage::StrokeAppended(stroke));
        }
    }

    /// Tears a peer's subscription down as an abrupt transport loss: the
    /// victim sees `Closed`, everyone else a presence leave.
    pub fn sever(&self, topic: &str, profile: ProfileId) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            let severed: Vec<u64> = state
                .peers
                .iter()
                .filter(|(_, peer)| peer.key == profile)
                .map(|(id, _)| *id)
                .collect();
            let mut was_tracked = false;
            for id in severed {
                if let Some(peer) = state.peers.remove(&id) {
                    was_tracked |= peer.tracked;
                    let _ = peer.tx.send(ChannelMessage::Closed);
                }
            }
            if was_tracked {
                state.fan_out(&ChannelMessage::PresenceLeave { profile });
                state.fan_out(&ChannelMessage::PresenceSync {
                    members: state.tracked_keys(),
                });
            }
        }
    }

    fn remove_peer(&self, topic: &str, id: u64) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            if let Some(peer) = state.peers.remove(&id) {
                // A key only leaves presence once its last connection does;
                // rapid reconnects keep it tracked throughout.
                let still_tracked = state
                    .peers
                    .values()
                    .any(|other| other.tracked && other.key == peer.key);
                if peer.tracked && !still_tracked {
                    state.fan_out(&ChannelMessage::PresenceLeave { profile: peer.key });
                    state.fan_out(&ChannelMessage::PresenceSync {
                        members: state.tracked_keys(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ChannelFactory for Arc<LocalHub> {
    async fn join(
        &self,
        room: &RoomCode,
        presence_key: ProfileId,
    ) -> Result<Subscription, ChannelError> {
        let topic = room.channel_topic();
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.topics.entry(topic.clone()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.peers.insert(
                id,
                Peer {
                    key: presence_key,
                    tracked: false,
                    tx: tx.clone(),
                },
            );
            // New subscribers receive the current presence snapshot first.
            let _ = tx.send(ChannelMessage::PresenceSync {
                members: state.tracked_keys(),
            });
            id
        };

        debug!(target = LOG_TARGET, %topic, %presence_key, "local subscriber joined");
        let channel = Arc::new(LocalChannel {
            hub: Arc::clone(self),
            topic,
            id,
        });
        Ok(Subscription {
            channel,
            messages: rx,
        })
    }
}

pub struct LocalChannel {
    hub: Arc<LocalHub>,
    topic: String,
    id: u64,
}

#[async_trait]
impl RoomChannel for LocalChannel {
    async fn track(&self, profile: ProfileId) -> Result<(), ChannelError> {
        let mut state = self
            .hub
            .topics
            .get_mut(&self.topic)
            .ok_or(ChannelError::Closed)?;
        match state.peers.get_mut(&self.id) {
            Some(peer) => {
                peer.tracked = true;
                peer.key = profile;
            }
            None => return Err(ChannelError::Closed),
        }
        state.fan_out(&ChannelMessage::PresenceJoin { profile });
        state.fan_out(&ChannelMessage::PresenceSync {
            members: state.tracked_keys(),
        });
        Ok(())
    }

    async fn send(&self, event: RoomEvent) -> Result<(), ChannelError> {
        let state = self
            .hub
            .topics
            .get(&self.topic)
            .ok_or(ChannelError::Closed)?;
        if !state.peers.contains_key(&self.id) {
            return Err(ChannelError::Closed);
        }
        state.fan_out(&ChannelMessage::Broadcast(event));
        Ok(())
    }

    async fn leave(&self) {
        self.hub.remove_peer(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn code(raw: &str) -> RoomCode {
        RoomCode::parse(raw).unwrap()
    }

    async fn drain_until_sync(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> Vec<ProfileId> {
        loop {
            match rx.recv().await.expect("channel open") {
                ChannelMessage::PresenceSync { members } => return members,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn broadcasts_echo_back_to_the_sender() {
        let hub = LocalHub::new();
        let room = code("ABCD");
        let alice = Uuid::new_v4();
        let mut sub = hub.join(&room, alice).await.unwrap();

        sub.channel.send(RoomEvent::CanvasClear).await.unwrap();
        loop {
            match sub.messages.recv().await.unwrap() {
                ChannelMessage::Broadcast(event) => {
                    assert_eq!(event, RoomEvent::CanvasClear);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn presence_flows_between_two_subscribers() {
        let hub = LocalHub::new();
        let room = code("ABCD");
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut alice_sub = hub.join(&room, alice).await.unwrap();
        alice_sub.channel.track(alice).await.unwrap();

        let mut bob_sub = hub.join(&room, bob).await.unwrap();
        // Bob's initial snapshot already contains Alice.
        let snapshot = drain_until_sync(&mut bob_sub.messages).await;
        assert_eq!(snapshot, vec![alice]);

        bob_sub.channel.track(bob).await.unwrap();
        // Alice eventually observes a snapshot holding both.
        loop {
            let members = drain_until_sync(&mut alice_sub.messages).await;
            if members.len() == 2 {
                assert!(members.contains(&alice) && members.contains(&bob));
                break;
            }
        }

        bob_sub.channel.leave().await;
        loop {
            match alice_sub.messages.recv().await.unwrap() {
                ChannelMessage::PresenceLeave { profile } => {
                    assert_eq!(profile, bob);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn sever_closes_the_victim_and_notifies_peers() {
        let hub = LocalHub::new();
        let room = code("ABCD");
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut alice_sub = hub.join(&room, alice).await.unwrap();
        alice_sub.channel.track(alice).await.unwrap();
        let mut bob_sub = hub.join(&room, bob).await.unwrap();
        bob_sub.channel.track(bob).await.unwrap();

        hub.sever(&room.channel_topic(), bob);

        loop {
            match bob_sub.messages.recv().await.unwrap() {
                ChannelMessage::Closed => break,
                _ => continue,
            }
        }
        loop {
            match alice_sub.messages.recv().await.unwrap() {
                ChannelMessage::PresenceLeave { profile } => {
                    assert_eq!(profile, bob);
                    break;
                }
                _ => continue,
            }
        }
    }
}
