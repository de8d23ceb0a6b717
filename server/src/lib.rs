//! # Match Server Library
//!
//! This library provides the authoritative server for two-player battleship
//! matches played over websockets. It pairs connecting players into matches,
//! runs a strictly alternating turn protocol with per-turn timeouts, and
//! broadcasts the authoritative board state after every accepted action.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Rules
//! Every shot is validated and resolved on the server. Clients never compute
//! game state; they render the `player-update-state` snapshots they receive,
//! in which the opponent's untouched ships are hidden.
//!
//! ### Connection Lifecycle
//! Handles each connection from upgrade to teardown:
//! - Identity taken from the `x-player-id` / `x-player-name` upgrade headers
//! - Seating into a free match, or a new one when none is free
//! - Liveness probing, with dead peers removed from their room
//! - Forfeit when a player leaves a running match
//!
//! ## Architecture Design
//!
//! ### One Event Loop Per Room
//! Every [`room::Room`] runs a single event-loop task that is the only writer
//! of its player set. Joins, leaves, inbound events and commands are handled
//! one at a time on that task, so the [`game::MatchState`] it drives needs no
//! locking of its own.
//!
//! ### Command Dispatch
//! Player shots and timer expiries both become a [`command::Command`] and go
//! through [`command::Command::apply`]. A turn change therefore always takes
//! the same path, whatever caused it.
//!
//! ### Cancellation
//! Rooms, matches and connections each own a one-shot shutdown signal and a
//! join barrier. Closing any of them is idempotent and returns only once the
//! tasks it spawned have exited.
//!
//! ## Module Organization
//!
//! - `config`: immutable [`config::ServerConfig`] and its validation
//! - `error`: join, command and server error types
//! - `board`: per-player board rules and masked snapshots
//! - `placement`: fleet layout for new players
//! - `player`: a connection pump paired with a player model
//! - `room`: player set, event loop, keep-alive ticker, broadcast
//! - `command`: closed set of match intents and the executor interface
//! - `game`: the match turn state machine
//! - `registry`: routing of new players into matches
//! - `network`: websocket accept loop and handshake
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config).await?;
//!
//!     // Trigger this from a signal handler to stop accepting and close
//!     // every match.
//!     let _shutdown = server.shutdown_handle();
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod board;
pub mod command;
pub mod config;
pub mod error;
pub mod game;
pub mod network;
pub mod placement;
pub mod player;
pub mod registry;
pub mod room;
