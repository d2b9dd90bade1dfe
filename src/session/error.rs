use crate::channel::ChannelError;
use crate::domain::RoomCode;
use crate::stores::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),
    #[error("room {0} already exists")]
    RoomExists(RoomCode),
    #[error("channel subscription failed: {0}")]
    ChannelSubscriptionFailed(String),
    #[error("need at least {min} connected players to start a round")]
    InsufficientPlayers { min: usize },
    #[error("only the host can do that")]
    NotHost,
    #[error("only the drawer can do that")]
    NotDrawer,
    #[error("the drawer cannot guess")]
    DrawerCannotGuess,
    #[error("no round is in progress")]
    NoActiveRound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
