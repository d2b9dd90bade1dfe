pub mod channel;
pub mod config;
pub mod domain;
pub mod events;
pub mod predict;
pub mod round;
pub mod session;
pub mod stores;

pub use config::GameConfig;
pub use session::{Session, SessionContext, SessionError, SessionPhase, SessionView};
