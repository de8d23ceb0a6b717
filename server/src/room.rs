//! Room: connection-lifecycle authority for a fixed-capacity group of players.
//!
//! A room owns one event-loop task and one keep-alive ticker. The event loop is
//! the only task that adds or removes players; it waits on four sources:
//!
//! - join requests, answered synchronously through a oneshot reply
//! - leave requests, from outside callers and from the ticker
//! - inbound events from every seated player's pump, accepted only when the
//!   connection token matches the one holding the seat
//! - commands addressed to the room's [`RoomHandler`]
//!
//! Broadcasts and pings read the player set under the read lock and never
//! mutate it. A player whose ping fails is queued on the leave channel.
//!
//! Closing cancels the shared [`Shutdown`], after which the event loop tears
//! down every seated player and exits. [`Room::close`] returns only once every
//! task the room spawned has exited.

use crate::error::JoinError;
use crate::player::Player;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{
    Connection, ConnectionId, Event, Inbound, PlayerId, SendError, Shutdown, TaskSet,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

/// Game logic plugged into a room's event loop. Every method runs on the
/// event-loop task, one at a time.
#[async_trait]
pub trait RoomHandler: Send + 'static {
    type Command: Send + 'static;

    /// Checks beyond capacity and duplicate ids, run before a player is seated.
    fn admit(&self, _player: &Player) -> Result<(), JoinError> {
        Ok(())
    }

    /// A player has been seated.
    async fn on_join(&mut self, player: PlayerId);

    /// A player has been removed; its pump is already closing.
    async fn on_leave(&mut self, player: Player);

    async fn on_event(&mut self, from: PlayerId, event: Event);

    async fn on_command(&mut self, command: Self::Command);

    /// The room is shutting down. Players are still seated.
    async fn on_close(&mut self);
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub id: String,
    pub capacity: usize,
    pub keep_alive: Duration,
    pub inbound_queue: usize,
}

struct JoinRequest {
    player: Player,
    reply: oneshot::Sender<Result<(), JoinError>>,
}

/// State visible to handlers, the ticker and outside handles.
#[derive(Debug)]
pub struct RoomShared {
    id: String,
    capacity: usize,
    players: RwLock<HashMap<PlayerId, Player>>,
    leave_tx: mpsc::Sender<PlayerId>,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl RoomShared {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.players.read().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.capacity
    }

    pub async fn players(&self) -> RwLockReadGuard<'_, HashMap<PlayerId, Player>> {
        self.players.read().await
    }

    /// Write access for the event-loop task only.
    pub(crate) async fn players_mut(&self) -> RwLockWriteGuard<'_, HashMap<PlayerId, Player>> {
        self.players.write().await
    }

    /// Sends `event` to every seated player. Per-player failures are logged
    /// and do not stop delivery to the rest.
    pub async fn broadcast(&self, event: &Event) {
        let players = self.players.read().await;
        for player in players.values() {
            deliver(player, event);
        }
    }

    /// Sends each player its own rendering of an event.
    pub async fn broadcast_with<F>(&self, render: F)
    where
        F: Fn(&HashMap<PlayerId, Player>, &PlayerId) -> Event,
    {
        let players = self.players.read().await;
        for player in players.values() {
            deliver(player, &render(&players, player.id()));
        }
    }

    pub async fn send_to(&self, id: &PlayerId, event: &Event) -> bool {
        match self.players.read().await.get(id) {
            Some(player) => {
                deliver(player, event);
                true
            }
            None => false,
        }
    }

    /// Queues a removal for the event loop.
    pub async fn request_leave(&self, id: PlayerId) {
        if self.leave_tx.send(id).await.is_err() {
            debug!("Room {} already stopped", self.id);
        }
    }

    /// Cancels the room without waiting. Safe to call from the event loop.
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Spawns a task that [`Room::close`] will wait for.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }
}

fn deliver(player: &Player, event: &Event) {
    match player.send(event) {
        Ok(()) => {}
        Err(SendError::Closed) => debug!("Skipping {} for closed {}", event.kind(), player.id()),
        Err(e) => warn!("Failed to send {} to {}: {}", event.kind(), player.id(), e),
    }
}

/// Handle to a running room.
#[derive(Debug)]
pub struct Room {
    shared: Arc<RoomShared>,
    join_tx: mpsc::Sender<JoinRequest>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl std::fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRequest")
            .field("player", self.player.id())
            .finish()
    }
}

impl Room {
    /// Starts the event loop and ticker. `make_handler` receives the shared
    /// state so the handler can broadcast and spawn timers.
    pub fn spawn<H, F>(
        settings: RoomSettings,
        commands: mpsc::Receiver<H::Command>,
        make_handler: F,
    ) -> Self
    where
        H: RoomHandler + Sync,
        F: FnOnce(Arc<RoomShared>) -> H,
    {
        let (join_tx, join_rx) = mpsc::channel(settings.capacity.max(1));
        let (leave_tx, leave_rx) = mpsc::channel(settings.capacity.max(1) * 2);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_queue.max(1));

        let shared = Arc::new(RoomShared {
            id: settings.id,
            capacity: settings.capacity,
            players: RwLock::new(HashMap::new()),
            leave_tx,
            shutdown: Shutdown::new(),
            tasks: TaskSet::new(),
        });

        let handler = make_handler(Arc::clone(&shared));
        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            handler,
            join_rx,
            leave_rx,
            inbound_rx,
            commands,
        };
        shared.spawn(event_loop.run());
        shared.spawn(keep_alive(Arc::clone(&shared), settings.keep_alive));

        debug!("Room {} opened with capacity {}", shared.id, shared.capacity);
        Self {
            shared,
            join_tx,
            inbound_tx,
        }
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn shared(&self) -> &Arc<RoomShared> {
        &self.shared
    }

    /// Sender that pumps of players joining this room must deliver into.
    pub fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx.clone()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub async fn is_full(&self) -> bool {
        self.shared.is_full().await
    }

    pub async fn len(&self) -> usize {
        self.shared.len().await
    }

    /// Seats a player. Rejections are decided immediately, never queued; a
    /// rejected player's connection is told why and closed.
    pub async fn join(&self, player: Player) -> Result<(), JoinError> {
        if self.shared.is_shut_down() {
            reject(&player, &JoinError::MatchClosed);
            return Err(JoinError::MatchClosed);
        }
        let (reply, answer) = oneshot::channel();
        if let Err(mpsc::error::SendError(request)) =
            self.join_tx.send(JoinRequest { player, reply }).await
        {
            reject(&request.player, &JoinError::MatchClosed);
            return Err(JoinError::MatchClosed);
        }
        answer.await.unwrap_or(Err(JoinError::MatchClosed))
    }

    pub async fn leave(&self, id: PlayerId) {
        self.shared.request_leave(id).await;
    }

    pub async fn broadcast(&self, event: &Event) {
        self.shared.broadcast(event).await;
    }

    /// Cancels the room without waiting for it to drain.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Cancels the room and waits until every player is unregistered and every
    /// task it spawned has exited. Idempotent.
    pub async fn close(&self) {
        if self.shared.shutdown() {
            debug!("Closing room {}", self.shared.id);
        }
        self.shared.tasks.join_all().await;
    }
}

pub(crate) fn reject(player: &Player, reason: &JoinError) {
    info!("Rejected {}: {}", player.id(), reason);
    let _ = player.send(&Event::notice(format!("join rejected: {}", reason)));
    player.connection().close();
}

struct EventLoop<H: RoomHandler> {
    shared: Arc<RoomShared>,
    handler: H,
    join_rx: mpsc::Receiver<JoinRequest>,
    leave_rx: mpsc::Receiver<PlayerId>,
    inbound_rx: mpsc::Receiver<Inbound>,
    commands: mpsc::Receiver<H::Command>,
}

impl<H: RoomHandler> EventLoop<H> {
    async fn run(mut self) {
        let shutdown = self.shared.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,

                Some(request) = self.join_rx.recv() => {
                    let JoinRequest { player, reply } = request;
                    let result = self.seat(player).await;
                    let _ = reply.send(result);
                }

                Some(id) = self.leave_rx.recv() => {
                    self.unseat(&id).await;
                }

                Some(inbound) = self.inbound_rx.recv() => match inbound {
                    Inbound::Event { from, conn, event } => {
                        if self.is_seated(&from, conn).await {
                            self.handler.on_event(from, event).await;
                        } else {
                            debug!(
                                "Dropping {} from unseated connection {} ({})",
                                event.kind(),
                                conn,
                                from
                            );
                        }
                    }
                    Inbound::Closed { from, conn } => {
                        if self.is_seated(&from, conn).await {
                            self.unseat(&from).await;
                        }
                    }
                },

                Some(command) = self.commands.recv() => {
                    self.handler.on_command(command).await;
                }
            }
        }

        self.teardown().await;
    }

    /// True only for the connection actually holding the seat, not another
    /// connection that presented the same player id.
    async fn is_seated(&self, id: &PlayerId, conn: ConnectionId) -> bool {
        self.shared
            .players
            .read()
            .await
            .get(id)
            .is_some_and(|p| p.connection().connection_id() == conn)
    }

    async fn seat(&mut self, player: Player) -> Result<(), JoinError> {
        let admitted = {
            let players = self.shared.players.read().await;
            if players.len() >= self.shared.capacity {
                Err(JoinError::RoomFull)
            } else if players.contains_key(player.id()) {
                Err(JoinError::DuplicatePlayer(player.id().clone()))
            } else {
                self.handler.admit(&player)
            }
        };
        if let Err(e) = admitted {
            reject(&player, &e);
            return Err(e);
        }

        let id = player.id().clone();
        self.shared.players.write().await.insert(id.clone(), player);
        info!("Player {} joined room {}", id, self.shared.id);
        self.handler.on_join(id).await;
        Ok(())
    }

    async fn unseat(&mut self, id: &PlayerId) {
        let removed = self.shared.players.write().await.remove(id);
        let Some(player) = removed else {
            return;
        };
        info!("Player {} left room {}", id, self.shared.id);

        let conn = Arc::clone(player.connection());
        conn.close();
        self.shared.spawn(async move { conn.closed().await });
        self.handler.on_leave(player).await;
    }

    async fn teardown(mut self) {
        self.handler.on_close().await;

        self.join_rx.close();
        while let Ok(request) = self.join_rx.try_recv() {
            reject(&request.player, &JoinError::MatchClosed);
            let _ = request.reply.send(Err(JoinError::MatchClosed));
        }
        self.leave_rx.close();
        self.inbound_rx.close();
        self.commands.close();

        let players: Vec<Player> = self
            .shared
            .players
            .write()
            .await
            .drain()
            .map(|(_, player)| player)
            .collect();
        for player in &players {
            player.connection().close();
        }
        futures_util::future::join_all(players.iter().map(|p| p.connection().closed())).await;

        info!(
            "Room {} closed, released {} players",
            self.shared.id,
            players.len()
        );
    }
}

/// Pings every seated player each period. A failed ping queues a leave.
async fn keep_alive(shared: Arc<RoomShared>, period: Duration) {
    let shutdown = shared.shutdown_signal();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {}
        }

        let conns: Vec<Arc<Connection>> = shared
            .players
            .read()
            .await
            .values()
            .map(|p| Arc::clone(p.connection()))
            .collect();

        let mut pings = JoinSet::new();
        for conn in conns {
            pings.spawn(async move {
                let result = conn.ping().await;
                (conn.id().clone(), result)
            });
        }

        while let Some(joined) = pings.join_next().await {
            let Ok((id, result)) = joined else {
                continue;
            };
            if let Err(e) = result {
                warn!("Ping to {} failed: {}, removing", id, e);
                tokio::select! {
                    _ = shutdown.triggered() => return,
                    _ = shared.request_leave(id) => {}
                }
            }
        }
    }
    debug!("Room {} keep-alive stopped", shared.id);
}
