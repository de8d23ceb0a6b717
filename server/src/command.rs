//! Closed set of match intents and their single dispatch point.
//!
//! Wire events from players and internal triggers such as the turn timer are
//! both turned into a [`Command`] and run through [`Command::apply`], so a
//! turn change always takes the same path whatever caused it.

use crate::error::CommandError;
use async_trait::async_trait;
use shared::PlayerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A player has been seated.
    Join(PlayerId),
    Fire {
        firing: PlayerId,
        target: PlayerId,
        x: u8,
        y: u8,
    },
    StartMatch,
    /// Pass the turn to the other player. `turn` names the turn being ended;
    /// `None` ends whichever turn is current.
    AdvanceTurn { turn: Option<u64> },
    EndMatch { winner: Option<PlayerId> },
    Close,
}

/// Operations a command may invoke on a match.
#[async_trait]
pub trait Executor: Send {
    async fn join(&mut self, player: PlayerId) -> Result<(), CommandError>;

    async fn fire(
        &mut self,
        firing: PlayerId,
        target: PlayerId,
        x: u8,
        y: u8,
    ) -> Result<(), CommandError>;

    async fn start(&mut self) -> Result<(), CommandError>;

    async fn advance_turn(&mut self, turn: Option<u64>) -> Result<(), CommandError>;

    async fn end(&mut self, winner: Option<PlayerId>) -> Result<(), CommandError>;

    async fn close(&mut self) -> Result<(), CommandError>;
}

impl Command {
    pub async fn apply<E>(self, executor: &mut E) -> Result<(), CommandError>
    where
        E: Executor + ?Sized,
    {
        match self {
            Command::Join(player) => executor.join(player).await,
            Command::Fire {
                firing,
                target,
                x,
                y,
            } => executor.fire(firing, target, x, y).await,
            Command::StartMatch => executor.start().await,
            Command::AdvanceTurn { turn } => executor.advance_turn(turn).await,
            Command::EndMatch { winner } => executor.end(winner).await,
            Command::Close => executor.close().await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Join(_) => "join",
            Command::Fire { .. } => "fire",
            Command::StartMatch => "start",
            Command::AdvanceTurn { .. } => "advance-turn",
            Command::EndMatch { .. } => "end",
            Command::Close => "close",
        }
    }
}
