//! Concurrency tests for match routing
//!
//! Many clients connect at once against a real loopback server. The registry
//! must pair them without ever seating a player twice or leaving a match with
//! a single player while another waits.

use client::network::identity_request;
use futures_util::StreamExt;
use server::config::ServerConfig;
use server::network::Server;
use server::placement::FixedLayout;
use shared::{Event, EventType, Payload, PlayerId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn config(max_connections: usize) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        board_size: 4,
        fleet: vec![2],
        max_connections,
        ..ServerConfig::default()
    }
}

async fn connect(addr: SocketAddr, id: &str) -> Result<Ws, tokio_tungstenite::tungstenite::Error> {
    let request = identity_request(&addr.to_string(), &PlayerId::new(id), id).unwrap();
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn wait_for(ws: &mut Ws, kind: EventType) -> Option<Event> {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next()).await.ok()??.ok()?;
        if let Message::Text(text) = message {
            if let Ok(event) = Event::decode(text.as_str()) {
                if event.kind() == kind {
                    return Some(event);
                }
            }
        }
    }
}

/// Twenty simultaneous players end up in ten full matches
#[tokio::test]
async fn concurrent_players_pair_into_matches() {
    let server = Server::bind_with(config(256), Arc::new(FixedLayout))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    let mut handles = Vec::new();
    for i in 0..20 {
        handles.push(tokio::spawn(async move {
            let id = format!("p{}", i);
            let mut ws = connect(addr, &id).await.expect("upgrade accepted");
            let start = wait_for(&mut ws, EventType::GameStart)
                .await
                .unwrap_or_else(|| panic!("{} never started", id));
            match start.payload {
                Payload::GameStart(start) => (id, start.match_id, start.players, ws),
                other => panic!("unexpected payload {:?}", other),
            }
        }));
    }

    let mut matches: HashMap<String, Vec<PlayerId>> = HashMap::new();
    let mut seen = HashSet::new();
    let mut sockets = Vec::new();
    for handle in handles {
        let (id, match_id, players, ws) = handle.await.unwrap();
        assert!(seen.insert(id.clone()), "{} seated twice", id);
        assert!(players.contains(&PlayerId::new(id.as_str())));
        matches.entry(match_id).or_insert(players);
        sockets.push(ws);
    }

    assert_eq!(matches.len(), 10);
    let mut seated = HashSet::new();
    for players in matches.values() {
        assert_eq!(players.len(), 2);
        for player in players {
            assert!(seated.insert(player.clone()), "{} in two matches", player);
        }
    }
    assert_eq!(seated.len(), 20);

    shutdown.trigger();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
}

/// Connections past the limit are answered with 503 instead of upgraded
#[tokio::test]
async fn connection_limit_is_enforced() {
    let server = Server::bind_with(config(2), Arc::new(FixedLayout))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    let mut a = connect(addr, "a").await.expect("first accepted");
    let mut b = connect(addr, "b").await.expect("second accepted");
    assert!(wait_for(&mut a, EventType::GameStart).await.is_some());
    assert!(wait_for(&mut b, EventType::GameStart).await.is_some());

    match connect(addr, "c").await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 503);
        }
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("connection over the limit must be refused"),
    }

    shutdown.trigger();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
}

/// Players dropping out of many matches at once each forfeit their own match
#[tokio::test]
async fn concurrent_disconnects_forfeit_independently() {
    let server = Server::bind_with(config(256), Arc::new(FixedLayout))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    // Connect in pairs so each match holds one "stay" and one "quit" player.
    let mut stayers = Vec::new();
    let mut quitters = Vec::new();
    for i in 0..5 {
        let mut stay = connect(addr, &format!("stay{}", i)).await.unwrap();
        let mut quit = connect(addr, &format!("quit{}", i)).await.unwrap();
        assert!(wait_for(&mut stay, EventType::GameStart).await.is_some());
        assert!(wait_for(&mut quit, EventType::GameStart).await.is_some());
        stayers.push((format!("stay{}", i), stay));
        quitters.push(quit);
    }

    futures_util::future::join_all(quitters.iter_mut().map(|ws| ws.close(None))).await;

    let results = futures_util::future::join_all(stayers.into_iter().map(|(id, mut ws)| async move {
        let end = wait_for(&mut ws, EventType::GameEnd).await;
        (id, end)
    }))
    .await;
    for (id, end) in results {
        match end.map(|e| e.payload) {
            Some(Payload::GameEnd(end)) => assert_eq!(end.winner, Some(PlayerId::new(id))),
            other => panic!("{} saw {:?}", id, other),
        }
    }

    shutdown.trigger();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
}
