use crate::game::ClientGameState;
use crate::input::{InputCommand, InputError};
use log::{debug, info, warn};
use shared::{
    ChatPayload, Connection, ConnectionConfig, Event, EventBus, EventType, Inbound, Payload,
    PlayerId, SendError, PLAYER_ID_HEADER, PLAYER_NAME_HEADER,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, WebSocketStream};

const INBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect: {0}")]
    Connect(#[from] WsError),
    #[error("invalid {0} header value")]
    Header(&'static str),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("input error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the upgrade request carrying the player's identity headers.
pub fn identity_request(server: &str, id: &PlayerId, name: &str) -> Result<Request, ClientError> {
    let url = if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{}/", server)
    };
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        PLAYER_ID_HEADER,
        HeaderValue::from_str(id.as_str()).map_err(|_| ClientError::Header(PLAYER_ID_HEADER))?,
    );
    headers.insert(
        PLAYER_NAME_HEADER,
        HeaderValue::from_str(name).map_err(|_| ClientError::Header(PLAYER_NAME_HEADER))?,
    );
    Ok(request)
}

pub struct Client {
    conn: Arc<Connection>,
    inbound: mpsc::Receiver<Inbound>,
    game: ClientGameState,
    bus: EventBus,
}

impl Client {
    pub async fn connect(server: &str, id: PlayerId, name: &str) -> Result<Self, ClientError> {
        let request = identity_request(server, &id, name)?;
        info!("Connecting to {} as {}...", request.uri(), id);
        let (ws, response) = connect_async(request).await?;
        debug!("Upgrade accepted with status {}", response.status());
        Ok(Self::from_stream(id, ws))
    }

    /// Wraps an already upgraded websocket.
    pub fn from_stream<S>(id: PlayerId, ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let conn = Connection::spawn(id.clone(), ws, inbound_tx, ConnectionConfig::default());

        let mut bus = EventBus::new();
        let outbound = Arc::clone(&conn);
        bus.subscribe(EventType::LocalMessage, move |event| {
            if let Payload::LocalMessage(local) = &event.payload {
                let chat = Event::new(Payload::SendMessage(ChatPayload {
                    from: None,
                    text: local.text.clone(),
                }));
                if let Err(e) = outbound.send(&chat) {
                    warn!("Could not send chat: {}", e);
                }
            }
        });

        Self {
            conn,
            inbound,
            game: ClientGameState::new(id),
            bus,
        }
    }

    pub fn game(&self) -> &ClientGameState {
        &self.game
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Applies a server event to the local view and publishes it on the bus.
    pub fn handle_event(&mut self, event: Event) -> Option<String> {
        let line = self.game.apply(&event);
        self.bus.publish(&event);
        line
    }

    /// Turns a typed command into an event. Local events stay on the bus;
    /// everything else goes to the server.
    pub fn submit(&mut self, command: &InputCommand) -> Result<(), ClientError> {
        let Some(event) = command.to_event(&self.game)? else {
            return Ok(());
        };
        if event.kind().is_local() {
            self.bus.publish(&event);
        } else {
            self.conn.send(&event)?;
        }
        Ok(())
    }

    /// Reads commands from `input` and prints server events until the user
    /// quits or the server closes the connection.
    pub async fn run<R>(mut self, input: R) -> Result<(), ClientError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut input_open = true;

        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Event { event, .. }) => {
                        if let Some(line) = self.handle_event(event) {
                            println!("{}", line);
                        }
                    }
                    Some(Inbound::Closed { .. }) | None => {
                        info!("Server closed the connection");
                        break;
                    }
                },
                line = lines.next_line(), if input_open => match line? {
                    Some(line) => match InputCommand::parse(&line) {
                        Ok(InputCommand::Quit) => break,
                        Ok(InputCommand::Board) => print!("{}", self.game.render()),
                        Ok(command) => {
                            if let Err(e) = self.submit(&command) {
                                eprintln!("{}", e);
                            }
                        }
                        Err(InputError::Empty) => {}
                        Err(e) => eprintln!("{}", e),
                    },
                    None => input_open = false,
                },
            }
        }

        // Nothing reads inbound any more; let the pump's close notice fail fast.
        self.inbound.close();
        self.conn.close();
        self.conn.closed().await;
        Ok(())
    }
}
