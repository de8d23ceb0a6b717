//! Server network layer: websocket accept loop and identity handshake.

use crate::board::PlayerModel;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::placement::{Placement, RandomPlacement};
use crate::player::Player;
use crate::registry::Registry;
use log::{debug, error, info, warn};
use shared::{Connection, PlayerId, Shutdown, TaskSet, PLAYER_ID_HEADER, PLAYER_NAME_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Identity presented in the upgrade request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PlayerId,
    pub name: String,
}

impl Identity {
    /// Reads the identity headers. A missing or blank id is refused; a
    /// missing name falls back to the id.
    pub fn from_request(request: &Request) -> Result<Self, ServerError> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let id = header(PLAYER_ID_HEADER)
            .ok_or_else(|| ServerError::Handshake(format!("missing {} header", PLAYER_ID_HEADER)))?;
        let name = header(PLAYER_NAME_HEADER).unwrap_or_else(|| id.clone());
        Ok(Self {
            id: PlayerId::new(id),
            name,
        })
    }
}

/// Main server: accepts websocket connections and hands them to the registry.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    placement: Arc<dyn Placement>,
    limiter: Arc<Semaphore>,
    shutdown: Shutdown,
    tasks: Arc<TaskSet>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with(config, Arc::new(RandomPlacement::default())).await
    }

    /// Binds with a custom fleet layout.
    pub async fn bind_with(
        config: ServerConfig,
        placement: Arc<dyn Placement>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry: Arc::new(Registry::new(config.clone())),
            limiter: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            placement,
            shutdown: Shutdown::new(),
            tasks: Arc::new(TaskSet::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Signal that stops [`Server::run`] when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until shut down, then closes every match and waits
    /// for in-flight handshakes.
    pub async fn run(self) -> Result<(), ServerError> {
        info!("Server started successfully");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.triggered() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                "Connection limit of {} reached, refusing {}",
                                self.config.max_connections, addr
                            );
                            self.tasks.spawn(refuse(
                                stream,
                                addr,
                                self.config.handshake_timeout,
                                self.shutdown.clone(),
                            ));
                            continue;
                        }
                    };
                    let session = Session {
                        registry: Arc::clone(&self.registry),
                        config: Arc::clone(&self.config),
                        placement: Arc::clone(&self.placement),
                        shutdown: self.shutdown.clone(),
                    };
                    self.tasks.spawn(session.handle(stream, addr, permit));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        info!("Server shutting down");
        self.registry.close_all().await;
        self.tasks.join_all().await;
        // Anything seated by a handshake that finished during close_all.
        self.registry.close_all().await;
        Ok(())
    }
}

/// Answers the upgrade with 503 so a client over the limit learns why.
async fn refuse(stream: TcpStream, addr: SocketAddr, wait: Duration, shutdown: Shutdown) {
    let callback = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
        let mut refusal = ErrorResponse::new(Some("server full".to_string()));
        *refusal.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        Err(refusal)
    };
    tokio::select! {
        _ = shutdown.triggered() => {}
        answered = timeout(wait, accept_hdr_async(stream, callback)) => {
            if answered.is_err() {
                debug!("Refusal to {} timed out", addr);
            }
        }
    }
}

/// Per-connection context for the handshake and seating.
struct Session {
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    placement: Arc<dyn Placement>,
    shutdown: Shutdown,
}

impl Session {
    async fn handle(self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let mut identity = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match Identity::from_request(request) {
                Ok(found) => {
                    identity = Some(found);
                    Ok(response)
                }
                Err(e) => {
                    let mut refusal = ErrorResponse::new(Some(e.to_string()));
                    *refusal.status_mut() = StatusCode::BAD_REQUEST;
                    Err(refusal)
                }
            }
        };

        let handshake = tokio::select! {
            _ = self.shutdown.triggered() => return,
            handshake = timeout(self.config.handshake_timeout, accept_hdr_async(stream, callback)) => handshake,
        };
        let ws = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", addr);
                return;
            }
        };
        let Some(Identity { id, name }) = identity else {
            return;
        };
        info!("Player {} ({}) connected from {}", id, name, addr);

        let board = match self
            .placement
            .place(self.config.board_size, &self.config.fleet)
        {
            Ok(board) => board,
            Err(e) => {
                error!("Could not lay out a board for {}: {}", id, e);
                return;
            }
        };
        let model = PlayerModel::new(id.clone(), name, board);
        let connection = self.config.connection();

        let seated = self
            .registry
            .find_or_create_and_join(|inbound| {
                let conn = Connection::spawn(id.clone(), ws, inbound, connection);
                Player::new(conn, model).with_permit(permit)
            })
            .await;
        match seated {
            Ok(joined) => debug!("Player {} routed to match {}", id, joined.id()),
            Err(e) => warn!("Player {} could not be seated: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn request(headers: &[(&'static str, &str)]) -> Request {
        let mut request = "ws://127.0.0.1:8080/".into_client_request().unwrap();
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, value.parse().unwrap());
        }
        request
    }

    #[test]
    fn test_identity_from_headers() {
        let identity = assert_ok!(Identity::from_request(&request(&[
            (PLAYER_ID_HEADER, "p-1"),
            (PLAYER_NAME_HEADER, "Ada"),
        ])));
        assert_eq!(identity.id, PlayerId::new("p-1"));
        assert_eq!(identity.name, "Ada");
    }

    #[test]
    fn test_identity_name_defaults_to_id() {
        let identity = assert_ok!(Identity::from_request(&request(&[(PLAYER_ID_HEADER, "p-1")])));
        assert_eq!(identity.name, "p-1");
    }

    #[test]
    fn test_identity_requires_id() {
        assert_err!(Identity::from_request(&request(&[])));
        assert_err!(Identity::from_request(&request(&[(PLAYER_ID_HEADER, "   ")])));
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            room_capacity: 4,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = assert_ok!(Server::bind(config).await);
        let shutdown = server.shutdown_handle();
        let running = tokio::spawn(server.run());

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("server stops")
            .unwrap();
        assert_ok!(result);
    }
}
