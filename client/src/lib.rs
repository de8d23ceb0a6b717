//! # Match Client Library
//!
//! A headless, line-oriented client for the battleship match server. It
//! connects over a websocket, keeps a local view of whatever the server
//! broadcasts, and turns typed commands into protocol events.
//!
//! ## Architecture Overview
//!
//! The client never decides anything about the game. Every board, turn and
//! result it shows comes from the server's `player-update-state`,
//! `player-turn` and `game-end` broadcasts, folded into a
//! [`game::ClientGameState`].
//!
//! ### Transport
//! The websocket is driven by the same [`shared::Connection`] pump the server
//! uses, so frames are decoded once and arrive as typed events.
//!
//! ### Event Bus
//! Inbound events are published on a [`shared::EventBus`] after the local view
//! is updated. Chat typed by the user starts life as an internal
//! `local-message` event; a bus handler converts it into a `send-message`
//! frame for the server. Local events are never encoded onto the wire.
//!
//! ## Module Organization
//!
//! - `game`: the broadcast-driven match view and text rendering
//! - `input`: parsing of `fire <x> <y>`, `say <text>`, `board` and `quit`
//! - `network`: connection setup with identity headers and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use shared::PlayerId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("127.0.0.1:8080", PlayerId::new("p-1"), "Ada").await?;
//!     client.run(tokio::io::BufReader::new(tokio::io::stdin())).await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
