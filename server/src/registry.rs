//! Match registry: routes newly connected players into matches.
//!
//! The registry is owned by the server root. Finding a free match, creating
//! one when none is free, and seating the player all happen under one lock,
//! so two players arriving together end up in the same match instead of each
//! opening their own.

use crate::config::ServerConfig;
use crate::error::JoinError;
use crate::game::Match;
use crate::player::Player;
use log::{debug, info};
use shared::Inbound;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug)]
pub struct Registry {
    matches: Mutex<Vec<Arc<Match>>>,
    config: ServerConfig,
}

impl Registry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            matches: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Seats a player in the first free match, creating one if needed.
    ///
    /// `seat` builds the player once the target match is known; it receives
    /// the match's inbound sender so the player's pump can be wired to it.
    pub async fn find_or_create_and_join<F>(&self, seat: F) -> Result<Arc<Match>, JoinError>
    where
        F: FnOnce(mpsc::Sender<Inbound>) -> Player,
    {
        let mut matches = self.matches.lock().await;
        reap(&mut matches);

        let found = first_free(&matches).await;
        let target = match found {
            Some(existing) => existing,
            None => {
                let created = Match::spawn(&self.config);
                matches.push(Arc::clone(&created));
                created
            }
        };

        let player = seat(target.inbound_sender());
        let id = player.id().clone();
        target.join(player).await?;
        info!("Player {} seated in match {}", id, target.id());
        Ok(target)
    }

    /// First match that is neither closed, started nor full.
    pub async fn find_free_match(&self) -> Option<Arc<Match>> {
        let mut matches = self.matches.lock().await;
        reap(&mut matches);
        first_free(&matches).await
    }

    pub async fn create_match(&self) -> Arc<Match> {
        let created = Match::spawn(&self.config);
        self.matches.lock().await.push(Arc::clone(&created));
        created
    }

    /// Number of matches not yet reaped.
    pub async fn len(&self) -> usize {
        self.matches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every match and waits for all of them to drain.
    pub async fn close_all(&self) {
        let matches: Vec<Arc<Match>> = self.matches.lock().await.drain(..).collect();
        if !matches.is_empty() {
            info!("Closing {} matches", matches.len());
        }
        futures_util::future::join_all(matches.iter().map(|m| m.close())).await;
    }
}

fn reap(matches: &mut Vec<Arc<Match>>) {
    matches.retain(|m| {
        let keep = !m.is_closed();
        if !keep {
            debug!("Reaping closed match {}", m.id());
        }
        keep
    });
}

async fn first_free(matches: &[Arc<Match>]) -> Option<Arc<Match>> {
    for candidate in matches {
        if candidate.is_closed() || candidate.is_started() {
            continue;
        }
        if !candidate.is_full().await {
            return Some(Arc::clone(candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::tests::{next_event, player_on, ws_pair, Peer};
    use shared::{EventType, PlayerId};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn test_config() -> ServerConfig {
        ServerConfig {
            board_size: 4,
            fleet: vec![2],
            turn_duration: Duration::from_secs(30),
            ..ServerConfig::default()
        }
    }

    async fn join(registry: &Registry, id: &str) -> (Result<Arc<Match>, JoinError>, Peer) {
        let (server, client) = ws_pair().await;
        let joined = registry
            .find_or_create_and_join(|inbound| player_on(id, server, inbound))
            .await;
        (joined, client)
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_free_match() {
        let registry = Registry::new(test_config());
        assert!(registry.find_free_match().await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_match_is_free() {
        let registry = Registry::new(test_config());
        let created = registry.create_match().await;
        let free = registry.find_free_match().await.expect("free match");
        assert_eq!(free.id(), created.id());
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_pairs_players_then_opens_new_match() {
        let registry = Registry::new(test_config());

        let (first, _p1) = join(&registry, "a").await;
        let (second, _p2) = join(&registry, "b").await;
        let (third, _p3) = join(&registry, "c").await;
        let (first, second, third) = (
            assert_ok!(first),
            assert_ok!(second),
            assert_ok!(third),
        );

        assert_eq!(first.id(), second.id());
        assert_ne!(first.id(), third.id());
        assert!(first.is_started());
        assert!(!third.is_started());
        assert_eq!(registry.len().await, 2);

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(first.is_closed() && third.is_closed());
    }

    #[tokio::test]
    async fn test_closed_matches_are_reaped() {
        let registry = Registry::new(test_config());
        let (waiting, _p1) = join(&registry, "a").await;
        let waiting = assert_ok!(waiting);

        waiting.close().await;
        assert!(registry.find_free_match().await.is_none());
        assert!(registry.is_empty().await);

        let (fresh, _p2) = join(&registry, "b").await;
        assert_ne!(assert_ok!(fresh).id(), waiting.id());
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_and_told_why() {
        let registry = Registry::new(test_config());
        let (_first, _p1) = join(&registry, "a").await;
        let (again, mut peer) = join(&registry, "a").await;

        assert_eq!(
            assert_err!(again),
            JoinError::DuplicatePlayer(PlayerId::new("a"))
        );
        let notice = next_event(&mut peer).await.expect("rejection notice");
        assert_eq!(notice.kind(), EventType::SendMessage);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_matches() {
        let registry = Arc::new(Registry::new(test_config()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (joined, peer) = join(&registry, &format!("p{}", i)).await;
                (assert_ok!(joined).id().to_string(), peer)
            }));
        }

        let mut per_match = std::collections::HashMap::new();
        let mut peers = Vec::new();
        for handle in handles {
            let (id, peer) = handle.await.unwrap();
            *per_match.entry(id).or_insert(0) += 1;
            peers.push(peer);
        }

        assert_eq!(per_match.len(), 4);
        assert!(per_match.values().all(|&seated| seated == 2));
        registry.close_all().await;
    }
}
