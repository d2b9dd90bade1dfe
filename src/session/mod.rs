//! The room synchronization core: a per-client session that reconciles
//! presence events, broadcasts, and change-feed notifications into one
//! consistent local view of the room and its round.

pub mod error;
pub mod inbox;
pub mod service;
pub mod state;


pub use error::SessionError;
pub use inbox::SessionInbox;
pub use service::{ReviewSummary, Session, SessionContext};
pub use state::{
    Effect, Input, MemberEntry, RoomMachine, SessionPhase, SessionView, TranscriptLine,
};
