//! Match: the battleship rules layered on top of a [`Room`].
//!
//! A match starts in `Waiting` and starts itself once both seats are filled.
//! The first turn goes to a seat chosen uniformly at random; after that the
//! turn strictly alternates. Each turn arms a timer that, on expiry, feeds an
//! `AdvanceTurn` command back through the room's command channel, so a
//! timeout and a resolved shot change the turn through the same code path.
//!
//! All of [`MatchState`] lives on the room's event-loop task. The [`Match`]
//! handle only sees a few status flags mirrored for the registry.

use crate::command::{Command, Executor};
use crate::config::ServerConfig;
use crate::error::{CommandError, JoinError};
use crate::player::Player;
use crate::room::{self, Room, RoomHandler, RoomSettings, RoomShared};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use shared::{
    ChatPayload, Event, FirePayload, GameEndPayload, GameStartPayload, JoinPayload, LeavePayload,
    MatchPhase, Payload, PlayerId, Shutdown, StatePayload, TurnPayload,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 32;

/// A command plus an optional reply slot for callers that want the outcome.
#[derive(Debug)]
pub struct Dispatch {
    command: Command,
    reply: Option<oneshot::Sender<Result<(), CommandError>>>,
}

impl Dispatch {
    fn internal(command: Command) -> Self {
        Self {
            command,
            reply: None,
        }
    }
}

/// Status mirrored out of the event loop for lock-free queries.
#[derive(Debug, Default)]
struct MatchStatus {
    started: AtomicBool,
    ended: AtomicBool,
    closed: AtomicBool,
    turn: Mutex<Option<PlayerId>>,
}

impl MatchStatus {
    fn set_turn(&self, turn: Option<PlayerId>) {
        *self.turn.lock().unwrap_or_else(PoisonError::into_inner) = turn;
    }

    fn turn(&self) -> Option<PlayerId> {
        self.turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Uniform pick over the seats; `None` when nobody is seated.
pub fn pick_random_player(seats: &[PlayerId]) -> Option<PlayerId> {
    seats.choose(&mut rand::thread_rng()).cloned()
}

/// Handle to a running match.
#[derive(Debug)]
pub struct Match {
    id: String,
    room: Room,
    commands: mpsc::Sender<Dispatch>,
    status: Arc<MatchStatus>,
}

impl Match {
    pub fn spawn(config: &ServerConfig) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let status = Arc::new(MatchStatus::default());
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let settings = RoomSettings {
            id: id.clone(),
            capacity: config.room_capacity,
            keep_alive: config.keep_alive,
            inbound_queue: config.inbound_queue,
        };
        let room = {
            let id = id.clone();
            let commands = commands.clone();
            let status = Arc::clone(&status);
            let turn_duration = config.turn_duration;
            let board_size = config.board_size;
            Room::spawn(settings, command_rx, move |room| MatchState {
                id,
                room,
                commands,
                status,
                phase: MatchPhase::Waiting,
                seats: Vec::new(),
                turn: None,
                turn_number: 0,
                turn_timer: None,
                turn_duration,
                board_size,
            })
        };

        info!("Created match {}", id);
        Arc::new(Self {
            id,
            room,
            commands,
            status,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<shared::Inbound> {
        self.room.inbound_sender()
    }

    /// Seats a player. Closed and started matches refuse immediately.
    pub async fn join(&self, player: Player) -> Result<(), JoinError> {
        let refused = if self.is_closed() {
            Some(JoinError::MatchClosed)
        } else if self.is_started() {
            Some(JoinError::MatchStarted)
        } else {
            None
        };
        if let Some(reason) = refused {
            room::reject(&player, &reason);
            return Err(reason);
        }
        self.room.join(player).await
    }

    /// Runs a command on the match and waits for its outcome.
    pub async fn execute(&self, command: Command) -> Result<(), CommandError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Dispatch {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| CommandError::Closed)?;
        answer.await.unwrap_or(Err(CommandError::Closed))
    }

    pub fn is_started(&self) -> bool {
        self.status.started.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.status.ended.load(Ordering::Acquire)
    }

    /// True once the match has been closed or its room shut down.
    pub fn is_closed(&self) -> bool {
        self.status.closed.load(Ordering::Acquire) || self.room.is_closed()
    }

    pub async fn is_full(&self) -> bool {
        self.room.is_full().await
    }

    pub async fn len(&self) -> usize {
        self.room.len().await
    }

    pub fn current_turn(&self) -> Option<PlayerId> {
        self.status.turn()
    }

    /// Closes the match from any state and waits for its room to drain.
    pub async fn close(&self) {
        self.status.closed.store(true, Ordering::Release);
        self.room.close().await;
    }
}

/// Game state owned by the room's event loop.
pub struct MatchState {
    id: String,
    room: Arc<RoomShared>,
    commands: mpsc::Sender<Dispatch>,
    status: Arc<MatchStatus>,
    phase: MatchPhase,
    /// Seated players in join order.
    seats: Vec<PlayerId>,
    turn: Option<PlayerId>,
    /// Incremented on every turn change; lets stale timer commands be ignored.
    turn_number: u64,
    turn_timer: Option<Shutdown>,
    turn_duration: Duration,
    board_size: u8,
}

impl MatchState {
    fn is_closed(&self) -> bool {
        self.status.closed.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), CommandError> {
        if self.is_closed() {
            return Err(CommandError::Closed);
        }
        match self.phase {
            MatchPhase::Waiting => Err(CommandError::NotStarted),
            MatchPhase::Ended => Err(CommandError::Ended),
            MatchPhase::Started => Ok(()),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.turn_timer.take() {
            timer.trigger();
        }
    }

    fn next_player(&self) -> Result<PlayerId, CommandError> {
        self.seats
            .iter()
            .find(|seat| Some(*seat) != self.turn.as_ref())
            .cloned()
            .ok_or(CommandError::NotEnoughPlayers)
    }

    async fn assign_turn(&mut self, next: PlayerId) {
        self.cancel_timer();
        self.turn_number += 1;
        self.turn = Some(next.clone());
        self.status.set_turn(Some(next.clone()));

        let cancel = Shutdown::new();
        self.turn_timer = Some(cancel.clone());
        let turn = self.turn_number;
        let duration = self.turn_duration;
        let commands = self.commands.clone();
        let stopped = self.room.shutdown_signal();
        let match_id = self.id.clone();
        self.room.spawn(async move {
            tokio::select! {
                _ = cancel.triggered() => {}
                _ = stopped.triggered() => {}
                _ = tokio::time::sleep(duration) => {
                    debug!("Turn {} of match {} timed out", turn, match_id);
                    let advance = Dispatch::internal(Command::AdvanceTurn { turn: Some(turn) });
                    tokio::select! {
                        _ = stopped.triggered() => {}
                        _ = commands.send(advance) => {}
                    }
                }
            }
        });

        debug!("Match {} turn {} goes to {}", self.id, turn, next);
        self.room
            .broadcast(&Event::new(Payload::PlayerTurn(TurnPayload {
                player_id: next,
                remaining_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            })))
            .await;
        self.broadcast_state().await;
    }

    /// Sends every player the authoritative state, with the opponent's
    /// untouched ships hidden.
    async fn broadcast_state(&self) {
        let phase = self.phase;
        let turn = &self.turn;
        let seats = &self.seats;
        self.room
            .broadcast_with(|players, viewer| {
                let snapshots = seats
                    .iter()
                    .filter_map(|id| players.get(id))
                    .map(|player| player.model.snapshot(viewer))
                    .collect();
                Event::new(Payload::PlayerUpdateState(StatePayload {
                    phase,
                    turn: turn.clone(),
                    players: snapshots,
                }))
            })
            .await;
    }
}

#[async_trait]
impl Executor for MatchState {
    async fn join(&mut self, player: PlayerId) -> Result<(), CommandError> {
        if self.phase != MatchPhase::Waiting {
            return Err(JoinError::MatchStarted.into());
        }
        let name = match self.room.players().await.get(&player) {
            Some(seated) => seated.name().to_string(),
            None => return Err(CommandError::UnknownTarget(player)),
        };
        if !self.seats.contains(&player) {
            self.seats.push(player.clone());
        }

        self.room
            .broadcast(&Event::new(Payload::Join(JoinPayload {
                player_id: player,
                name,
            })))
            .await;
        self.broadcast_state().await;

        if self.seats.len() >= self.room.capacity() {
            self.start().await?;
        }
        Ok(())
    }

    async fn fire(
        &mut self,
        firing: PlayerId,
        target: PlayerId,
        x: u8,
        y: u8,
    ) -> Result<(), CommandError> {
        self.ensure_running()?;
        if self.turn.as_ref() != Some(&firing) {
            return Err(CommandError::NotYourTurn(firing));
        }
        if x >= self.board_size || y >= self.board_size {
            return Err(CommandError::OutOfBounds { x, y });
        }
        if !self.seats.contains(&target) {
            return Err(CommandError::UnknownTarget(target));
        }
        if target == firing {
            return Err(CommandError::InvalidTarget(firing));
        }

        let (shot, sunk) = {
            let mut players = self.room.players_mut().await;
            let victim = players
                .get_mut(&target)
                .ok_or_else(|| CommandError::UnknownTarget(target.clone()))?;
            let shot = victim.model.receive_fire(x, y);
            (shot, victim.model.is_dead())
        };
        info!(
            "Match {}: {} fired at {} ({}, {}): {:?}",
            self.id, firing, target, x, y, shot
        );

        self.room
            .broadcast(&Event::new(Payload::Fire(FirePayload {
                firing_id: firing.clone(),
                target_id: target,
                x,
                y,
            })))
            .await;
        self.broadcast_state().await;

        if sunk {
            Command::EndMatch {
                winner: Some(firing),
            }
            .apply(self)
            .await
        } else {
            Command::AdvanceTurn { turn: None }.apply(self).await
        }
    }

    async fn start(&mut self) -> Result<(), CommandError> {
        if self.is_closed() {
            return Err(CommandError::Closed);
        }
        match self.phase {
            MatchPhase::Started => return Err(CommandError::AlreadyStarted),
            MatchPhase::Ended => return Err(CommandError::Ended),
            MatchPhase::Waiting => {}
        }
        if self.seats.len() < self.room.capacity().max(2) {
            return Err(CommandError::NotEnoughPlayers);
        }
        let first = pick_random_player(&self.seats).ok_or(CommandError::NotEnoughPlayers)?;

        self.phase = MatchPhase::Started;
        self.status.started.store(true, Ordering::Release);
        info!("Match {} started: {:?}", self.id, self.seats);

        self.room
            .broadcast(&Event::new(Payload::GameStart(GameStartPayload {
                match_id: self.id.clone(),
                players: self.seats.clone(),
                board_size: self.board_size,
            })))
            .await;
        self.assign_turn(first).await;
        Ok(())
    }

    async fn advance_turn(&mut self, turn: Option<u64>) -> Result<(), CommandError> {
        self.ensure_running()?;
        if let Some(number) = turn {
            if number != self.turn_number {
                return Err(CommandError::StaleTurn(number));
            }
        }
        let next = self.next_player()?;
        self.assign_turn(next).await;
        Ok(())
    }

    async fn end(&mut self, winner: Option<PlayerId>) -> Result<(), CommandError> {
        if self.phase == MatchPhase::Ended {
            return Err(CommandError::Ended);
        }
        self.cancel_timer();
        self.phase = MatchPhase::Ended;
        self.turn = None;
        self.status.set_turn(None);
        self.status.ended.store(true, Ordering::Release);

        match &winner {
            Some(winner) => info!("Match {} ended, {} wins", self.id, winner),
            None => info!("Match {} ended without a winner", self.id),
        }
        self.room
            .broadcast(&Event::new(Payload::GameEnd(GameEndPayload { winner })))
            .await;
        self.broadcast_state().await;

        // Ended matches do not linger; the room drains and closes.
        self.room.shutdown();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CommandError> {
        self.status.closed.store(true, Ordering::Release);
        self.cancel_timer();
        self.room.shutdown();
        Ok(())
    }
}

#[async_trait]
impl RoomHandler for MatchState {
    type Command = Dispatch;

    fn admit(&self, _player: &Player) -> Result<(), JoinError> {
        if self.is_closed() {
            return Err(JoinError::MatchClosed);
        }
        match self.phase {
            MatchPhase::Waiting => Ok(()),
            MatchPhase::Started => Err(JoinError::MatchStarted),
            MatchPhase::Ended => Err(JoinError::MatchClosed),
        }
    }

    async fn on_join(&mut self, player: PlayerId) {
        if let Err(e) = Command::Join(player.clone()).apply(self).await {
            warn!("Match {}: join of {} failed: {}", self.id, player, e);
        }
    }

    async fn on_leave(&mut self, player: Player) {
        let id = player.id().clone();
        self.seats.retain(|seat| seat != &id);
        self.room
            .broadcast(&Event::new(Payload::Leave(LeavePayload {
                player_id: id.clone(),
            })))
            .await;

        match self.phase {
            MatchPhase::Waiting => self.broadcast_state().await,
            MatchPhase::Started => {
                self.room
                    .broadcast(&Event::notice(format!("{} left the match", player.name())))
                    .await;
                let winner = self.seats.first().cloned();
                if let Err(e) = (Command::EndMatch { winner }).apply(self).await {
                    warn!("Match {}: forfeit after {} left failed: {}", self.id, id, e);
                }
            }
            MatchPhase::Ended => {}
        }
    }

    async fn on_event(&mut self, from: PlayerId, event: Event) {
        match event.payload {
            Payload::Fire(fire) => {
                if fire.firing_id != from {
                    warn!(
                        "Match {}: {} sent a shot as {}, using the connection identity",
                        self.id, from, fire.firing_id
                    );
                }
                let command = Command::Fire {
                    firing: from.clone(),
                    target: fire.target_id,
                    x: fire.x,
                    y: fire.y,
                };
                if let Err(e) = command.apply(self).await {
                    warn!("Match {}: rejected fire from {}: {}", self.id, from, e);
                }
            }
            Payload::SendMessage(chat) => {
                let name = self
                    .room
                    .players()
                    .await
                    .get(&from)
                    .map(|p| p.name().to_string())
                    .unwrap_or_else(|| from.to_string());
                self.room
                    .broadcast(&Event::new(Payload::SendMessage(ChatPayload {
                        from: Some(name),
                        text: chat.text,
                    })))
                    .await;
            }
            other => debug!(
                "Match {}: ignoring {} from {}",
                self.id,
                other.kind(),
                from
            ),
        }
    }

    async fn on_command(&mut self, dispatch: Dispatch) {
        let Dispatch { command, reply } = dispatch;
        let name = command.name();
        let result = command.apply(self).await;
        match &result {
            Ok(()) => {}
            Err(CommandError::StaleTurn(turn)) => {
                debug!("Match {}: ignoring timer for turn {}", self.id, turn)
            }
            Err(e) => warn!("Match {}: {} rejected: {}", self.id, name, e),
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn on_close(&mut self) {
        self.status.closed.store(true, Ordering::Release);
        self.cancel_timer();
        info!("Match {} closed", self.id);
    }
}
