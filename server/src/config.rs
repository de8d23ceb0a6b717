//! Immutable server configuration, built once in `main` and shared by value.

use crate::error::ServerError;
use shared::{ConnectionConfig, DEFAULT_BOARD_SIZE};
use std::time::Duration;

/// Ship lengths placed on every board.
pub const DEFAULT_FLEET: [u8; 5] = [5, 4, 3, 3, 2];

/// Seats in a battleship match.
pub const MATCH_CAPACITY: usize = 2;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub room_capacity: usize,
    /// Time a player has to fire before the turn passes automatically.
    pub turn_duration: Duration,
    /// Interval between liveness pings.
    pub keep_alive: Duration,
    /// A peer silent for longer than this is considered dead.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub board_size: u8,
    pub fleet: Vec<u8>,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            room_capacity: MATCH_CAPACITY,
            turn_duration: Duration::from_secs(30),
            keep_alive: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            max_connections: 256,
            board_size: DEFAULT_BOARD_SIZE,
            fleet: DEFAULT_FLEET.to_vec(),
            inbound_queue: 256,
            outbound_queue: 64,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Rejects values the match engine cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.room_capacity != MATCH_CAPACITY {
            return Err(ServerError::Config(format!(
                "room capacity must be {}, got {}",
                MATCH_CAPACITY, self.room_capacity
            )));
        }
        if self.board_size == 0 {
            return Err(ServerError::Config("board size must be positive".into()));
        }
        if self.keep_alive.is_zero() {
            return Err(ServerError::Config("keep-alive interval must be positive".into()));
        }
        if self.idle_timeout <= self.keep_alive {
            return Err(ServerError::Config(
                "idle timeout must be longer than the keep-alive interval".into(),
            ));
        }
        if self.max_connections == 0 || self.inbound_queue == 0 || self.outbound_queue == 0 {
            return Err(ServerError::Config(
                "connection limit and queue depths must be positive".into(),
            ));
        }
        if self.fleet.is_empty() || self.fleet.iter().any(|&len| len == 0) {
            return Err(ServerError::Config("fleet must contain ships of positive length".into()));
        }
        if self.fleet.iter().any(|&len| len > self.board_size) {
            return Err(ServerError::Config("a ship is longer than the board".into()));
        }
        let ship_cells: usize = self.fleet.iter().map(|&len| len as usize).sum();
        let board_cells = self.board_size as usize * self.board_size as usize;
        if ship_cells > board_cells {
            return Err(ServerError::Config("fleet does not fit on the board".into()));
        }
        Ok(())
    }

    /// Pump settings derived from the keep-alive policy.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_queue: self.outbound_queue,
            idle_timeout: self.idle_timeout,
            ping_wait: self.keep_alive,
            write_timeout: self.keep_alive,
        }
    }
}
