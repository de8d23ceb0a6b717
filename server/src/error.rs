//! Typed failures returned by the match engine.
//!
//! Capacity and command errors are ordinary outcomes handed back to the caller.
//! Only [`ServerError::Bind`] is fatal to the process.

use shared::PlayerId;
use std::io;
use thiserror::Error;

/// Why a player could not be seated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("room is full")]
    RoomFull,

    #[error("match already started")]
    MatchStarted,

    #[error("match is closed")]
    MatchClosed,

    #[error("player {0} is already seated")]
    DuplicatePlayer(PlayerId),
}

/// Why a command was refused. Refused commands leave the match untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("it is not {0}'s turn")]
    NotYourTurn(PlayerId),

    #[error("cell ({x}, {y}) is outside the board")]
    OutOfBounds { x: u8, y: u8 },

    #[error("no player {0} in this match")]
    UnknownTarget(PlayerId),

    #[error("player {0} cannot target themselves")]
    InvalidTarget(PlayerId),

    #[error("match has not started")]
    NotStarted,

    #[error("match already started")]
    AlreadyStarted,

    #[error("match needs two seated players")]
    NotEnoughPlayers,

    #[error("match already ended")]
    Ended,

    #[error("match is closed")]
    Closed,

    #[error("turn {0} already passed")]
    StaleTurn(u64),

    #[error(transparent)]
    Join(#[from] JoinError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
