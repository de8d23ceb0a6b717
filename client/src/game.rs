use log::debug;
use shared::{CellView, Event, MatchPhase, Payload, PlayerId, PlayerSnapshot, DEFAULT_BOARD_SIZE};

/// Render-free view of a match, rebuilt from whatever the server broadcasts.
#[derive(Debug, Clone)]
pub struct ClientGameState {
    pub me: PlayerId,
    pub match_id: Option<String>,
    pub board_size: u8,
    pub phase: MatchPhase,
    pub turn: Option<PlayerId>,
    pub turn_remaining_ms: u64,
    pub players: Vec<PlayerSnapshot>,
    pub opponent: Option<PlayerId>,
    pub winner: Option<PlayerId>,
    pub chat: Vec<String>,
}

impl ClientGameState {
    pub fn new(me: PlayerId) -> Self {
        Self {
            me,
            match_id: None,
            board_size: DEFAULT_BOARD_SIZE,
            phase: MatchPhase::Waiting,
            turn: None,
            turn_remaining_ms: 0,
            players: Vec::new(),
            opponent: None,
            winner: None,
            chat: Vec::new(),
        }
    }

    /// Folds one server event into the view. Returns a line worth showing
    /// to the user, if any.
    pub fn apply(&mut self, event: &Event) -> Option<String> {
        match &event.payload {
            Payload::Join(join) => {
                if join.player_id != self.me {
                    self.opponent = Some(join.player_id.clone());
                }
                Some(format!("{} joined", join.name))
            }
            Payload::Leave(leave) => {
                if self.opponent.as_ref() == Some(&leave.player_id) {
                    self.opponent = None;
                }
                Some(format!("{} left", leave.player_id))
            }
            Payload::GameStart(start) => {
                self.match_id = Some(start.match_id.clone());
                self.board_size = start.board_size;
                self.phase = MatchPhase::Started;
                self.opponent = start.players.iter().find(|id| **id != self.me).cloned();
                Some(format!("Match {} started", start.match_id))
            }
            Payload::GameEnd(end) => {
                self.phase = MatchPhase::Ended;
                self.turn = None;
                self.winner = end.winner.clone();
                Some(match &end.winner {
                    Some(winner) if *winner == self.me => "You won!".to_string(),
                    Some(winner) => format!("{} won", winner),
                    None => "Match ended without a winner".to_string(),
                })
            }
            Payload::PlayerUpdateState(state) => {
                self.phase = state.phase;
                self.turn = state.turn.clone();
                self.players = state.players.clone();
                if self.opponent.is_none() {
                    self.opponent = self
                        .players
                        .iter()
                        .map(|p| &p.id)
                        .find(|id| **id != self.me)
                        .cloned();
                }
                debug!("State update: {:?}, turn {:?}", self.phase, self.turn);
                None
            }
            Payload::PlayerTurn(turn) => {
                self.turn = Some(turn.player_id.clone());
                self.turn_remaining_ms = turn.remaining_ms;
                Some(if self.is_my_turn() {
                    format!("Your turn ({}s)", turn.remaining_ms / 1000)
                } else {
                    format!("{}'s turn", turn.player_id)
                })
            }
            Payload::Fire(fire) => Some(format!(
                "{} fired at {} ({}, {})",
                fire.firing_id, fire.target_id, fire.x, fire.y
            )),
            Payload::SendMessage(chat) => {
                let line = match &chat.from {
                    Some(from) => format!("[{}] {}", from, chat.text),
                    None => format!("* {}", chat.text),
                };
                self.chat.push(line.clone());
                Some(line)
            }
            Payload::LocalMessage(_) => None,
        }
    }

    pub fn is_my_turn(&self) -> bool {
        self.turn.as_ref() == Some(&self.me)
    }

    pub fn snapshot(&self, id: &PlayerId) -> Option<&PlayerSnapshot> {
        self.players.iter().find(|p| p.id == *id)
    }

    /// Both boards as text, own board first.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(mine) = self.snapshot(&self.me) {
            out.push_str(&format!("Your fleet ({} left)\n", mine.remaining));
            out.push_str(&render_board(mine));
        }
        if let Some(theirs) = self.opponent.as_ref().and_then(|id| self.snapshot(id)) {
            out.push_str(&format!("{} ({} left)\n", theirs.name, theirs.remaining));
            out.push_str(&render_board(theirs));
        }
        out
    }
}

fn cell_char(cell: CellView) -> char {
    match cell {
        CellView::Unknown => '~',
        CellView::Empty => '.',
        CellView::Ship => '#',
        CellView::Hit => 'X',
        CellView::Miss => 'o',
    }
}

pub fn render_board(snapshot: &PlayerSnapshot) -> String {
    let mut out = String::new();
    for row in &snapshot.board {
        out.extend(row.iter().map(|cell| cell_char(*cell)));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        ChatPayload, GameEndPayload, GameStartPayload, JoinPayload, StatePayload, TurnPayload,
    };

    fn state() -> ClientGameState {
        ClientGameState::new(PlayerId::new("me"))
    }

    fn snapshot(id: &str, board: Vec<Vec<CellView>>) -> PlayerSnapshot {
        PlayerSnapshot {
            id: PlayerId::new(id),
            name: id.to_uppercase(),
            remaining: 2,
            board,
        }
    }

    #[test]
    fn test_game_start_sets_opponent() {
        let mut game = state();
        let line = game.apply(&Event::new(Payload::GameStart(GameStartPayload {
            match_id: "m1".into(),
            players: vec![PlayerId::new("them"), PlayerId::new("me")],
            board_size: 4,
        })));

        assert_eq!(line.as_deref(), Some("Match m1 started"));
        assert_eq!(game.phase, MatchPhase::Started);
        assert_eq!(game.board_size, 4);
        assert_eq!(game.opponent, Some(PlayerId::new("them")));
    }

    #[test]
    fn test_own_join_does_not_become_opponent() {
        let mut game = state();
        game.apply(&Event::new(Payload::Join(JoinPayload {
            player_id: PlayerId::new("me"),
            name: "Me".into(),
        })));
        assert_eq!(game.opponent, None);
    }

    #[test]
    fn test_turn_tracking() {
        let mut game = state();
        game.apply(&Event::new(Payload::PlayerTurn(TurnPayload {
            player_id: PlayerId::new("me"),
            remaining_ms: 30_000,
        })));
        assert!(game.is_my_turn());

        let line = game.apply(&Event::new(Payload::PlayerTurn(TurnPayload {
            player_id: PlayerId::new("them"),
            remaining_ms: 30_000,
        })));
        assert!(!game.is_my_turn());
        assert_eq!(line.as_deref(), Some("them's turn"));
    }

    #[test]
    fn test_state_snapshot_replaces_view() {
        let mut game = state();
        game.apply(&Event::new(Payload::PlayerUpdateState(StatePayload {
            phase: MatchPhase::Started,
            turn: Some(PlayerId::new("them")),
            players: vec![
                snapshot("me", vec![vec![CellView::Ship, CellView::Hit]]),
                snapshot("them", vec![vec![CellView::Unknown, CellView::Miss]]),
            ],
        })));

        assert_eq!(game.opponent, Some(PlayerId::new("them")));
        assert_eq!(game.turn, Some(PlayerId::new("them")));
        assert_eq!(game.render(), "Your fleet (2 left)\n#X\nTHEM (2 left)\n~o\n");
    }

    #[test]
    fn test_chat_and_notices_are_logged() {
        let mut game = state();
        game.apply(&Event::new(Payload::SendMessage(ChatPayload {
            from: Some("Ada".into()),
            text: "hi".into(),
        })));
        game.apply(&Event::notice("opponent left"));
        assert_eq!(game.chat, vec!["[Ada] hi", "* opponent left"]);
    }

    #[test]
    fn test_game_end_reports_winner() {
        let mut game = state();
        let line = game.apply(&Event::new(Payload::GameEnd(GameEndPayload {
            winner: Some(PlayerId::new("me")),
        })));
        assert_eq!(line.as_deref(), Some("You won!"));
        assert_eq!(game.phase, MatchPhase::Ended);
        assert_eq!(game.winner, Some(PlayerId::new("me")));
    }
}
