//! A seated player: the connection pump plus the game-facing model.

use crate::board::PlayerModel;
use shared::{Connection, Event, PlayerId, SendError};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug)]
pub struct Player {
    conn: Arc<Connection>,
    pub model: PlayerModel,
    /// Connection slot, released when the player is dropped.
    permit: Option<OwnedSemaphorePermit>,
}

impl Player {
    pub fn new(conn: Arc<Connection>, model: PlayerModel) -> Self {
        Self {
            conn,
            model,
            permit: None,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn id(&self) -> &PlayerId {
        &self.model.id
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn send(&self, event: &Event) -> Result<(), SendError> {
        self.conn.send(event)
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }
}
