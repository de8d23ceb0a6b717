//! Line-oriented command input.

use crate::game::ClientGameState;
use shared::{Event, FirePayload, LocalMessagePayload, Payload};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Fire { x: u8, y: u8 },
    Say(String),
    Board,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("no opponent yet")]
    NoOpponent,
}

impl InputCommand {
    /// Parses `fire <x> <y>`, `say <text>`, `board` or `quit`.
    pub fn parse(line: &str) -> Result<Self, InputError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "" => Err(InputError::Empty),
            "fire" | "f" => {
                let mut coords = rest.split_whitespace().map(str::parse::<u8>);
                match (coords.next(), coords.next(), coords.next()) {
                    (Some(Ok(x)), Some(Ok(y)), None) => Ok(InputCommand::Fire { x, y }),
                    _ => Err(InputError::Usage("fire <x> <y>")),
                }
            }
            "say" => {
                if rest.is_empty() {
                    Err(InputError::Usage("say <text>"))
                } else {
                    Ok(InputCommand::Say(rest.to_string()))
                }
            }
            "board" => Ok(InputCommand::Board),
            "quit" | "exit" => Ok(InputCommand::Quit),
            other => Err(InputError::Unknown(other.to_string())),
        }
    }

    /// Event to publish for this command. Chat becomes a local message that
    /// the bus turns into a wire event.
    pub fn to_event(&self, game: &ClientGameState) -> Result<Option<Event>, InputError> {
        match self {
            InputCommand::Fire { x, y } => {
                let target = game.opponent.clone().ok_or(InputError::NoOpponent)?;
                Ok(Some(Event::new(Payload::Fire(FirePayload {
                    firing_id: game.me.clone(),
                    target_id: target,
                    x: *x,
                    y: *y,
                }))))
            }
            InputCommand::Say(text) => Ok(Some(Event::new(Payload::LocalMessage(
                LocalMessagePayload { text: text.clone() },
            )))),
            InputCommand::Board | InputCommand::Quit => Ok(None),
        }
    }
}
