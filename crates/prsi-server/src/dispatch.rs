//! Translates a parsed `REQ` line into session/room operations and the
//! outbound lines they produce. One function per command, mirroring the
//! original's `handle_req` switch; strike bookkeeping for malformed lines
//! happens one level up, in the actor's line-received handler.

use prsi_core::card::Card;
use prsi_core::protocol::{ErrorCode, Message, MsgType};

use crate::room::{self, PlayResult, RoomId};
use crate::session::{ClientTable, ConnId, LoginError, ResumeError};

pub struct Server {
    pub clients: ClientTable,
    pub rooms: room::RoomRegistry,
}

fn err_line(cmd: &str, code: ErrorCode, msg: &str) -> String {
    format!("ERR {cmd} code={code} msg={msg}")
}

/// Validates the `wish` field against the card being played. Only Queens
/// consult it: absent is `WISH_REQUIRED`, present-but-not-a-suit-letter is
/// `BAD_WISH`, anything else ignores it entirely (even if present and junk).
fn parse_wish(card: Card, wish_raw: Option<&str>) -> Result<Option<prsi_core::card::Suit>, ErrorCode> {
    use prsi_core::card::{Rank, Suit};

    if card.rank() != Rank::Queen {
        return Ok(None);
    }
    let Some(raw) = wish_raw else {
        return Err(ErrorCode::WishRequired);
    };
    let mut chars = raw.chars();
    let suit = chars.next().and_then(Suit::from_char);
    match (suit, chars.next()) {
        (Some(s), None) => Ok(Some(s)),
        _ => Err(ErrorCode::BadWish),
    }
}

impl Server {
    pub fn new(max_clients: usize, max_rooms: usize) -> Server {
        Server {
            clients: ClientTable::new(max_clients),
            rooms: room::RoomRegistry::new(max_rooms),
        }
    }

    /// Handles one already-parsed, already-typed `REQ` line.
    pub fn handle_req(&mut self, ci: ConnId, msg: &Message) {
        match msg.cmd.as_str() {
            "LOGIN" => self.handle_login(ci, msg),
            "LOGOUT" => self.handle_logout(ci),
            "RESUME" => self.handle_resume(ci, msg),
            "LIST_ROOMS" => self.handle_list_rooms(ci),
            "CREATE_ROOM" => self.handle_create_room(ci, msg),
            "JOIN_ROOM" => self.handle_join_room(ci, msg),
            "LEAVE_ROOM" => self.handle_leave_room(ci),
            "START_GAME" => self.handle_start_game(ci),
            "PLAY" => self.handle_play(ci, msg),
            "DRAW" => self.handle_draw(ci),
            "PING" => self.handle_ping(ci),
            other => self.clients.send(ci, err_line(other, ErrorCode::UnknownCmd, "unknown")),
        }
    }

    fn handle_login(&mut self, ci: ConnId, msg: &Message) {
        let Some(nick) = msg.get("nick") else {
            self.clients.send(ci, err_line("LOGIN", ErrorCode::BadFormat, "missing_nick"));
            return;
        };
        match self.clients.login(ci, nick) {
            Ok(token) => self.clients.send(ci, format!("RESP LOGIN ok=1 session={token}")),
            Err(LoginError::MissingNick) => {
                self.clients.send(ci, err_line("LOGIN", ErrorCode::BadFormat, "missing_nick"))
            }
            Err(LoginError::NickTooLong) => {
                self.clients.send(ci, err_line("LOGIN", ErrorCode::InvalidValue, "nick_too_long"))
            }
            Err(LoginError::NickTakenOnline) => {
                self.clients.send(ci, err_line("LOGIN", ErrorCode::NickTaken, "already_online"))
            }
            Err(LoginError::NickTakenOffline) => {
                self.clients.send(ci, err_line("LOGIN", ErrorCode::NickTaken, "use_resume_offline"))
            }
        }
    }

    fn handle_logout(&mut self, ci: ConnId) {
        let room_id = self.clients.get(ci).and_then(|s| s.identity.room_id);
        if let Some(room_id) = room_id {
            room::leave_room_aborting_game(&mut self.clients, &mut self.rooms, ci, room_id, "logout");
        }
        self.clients.send(ci, "RESP LOGOUT ok=1");
        self.clients.free(ci);
    }

    fn handle_resume(&mut self, ci: ConnId, msg: &Message) {
        let (Some(nick), Some(session)) = (msg.get("nick"), msg.get("session")) else {
            self.clients.send(ci, err_line("RESUME", ErrorCode::BadFormat, "missing_fields"));
            return;
        };

        let (room_id, freed) = match self.clients.resume(ci, nick, session) {
            Ok(v) => v,
            Err(ResumeError::NoSuchNick) => {
                self.clients.send(ci, err_line("RESUME", ErrorCode::BadSession, "no_such_nick"));
                return;
            }
            Err(ResumeError::BadToken) => {
                self.clients.send(ci, err_line("RESUME", ErrorCode::BadSession, "token"));
                return;
            }
            Err(ResumeError::AlreadyOnline) => {
                self.clients.send(ci, err_line("RESUME", ErrorCode::AlreadyOnline, "use_login"));
                return;
            }
        };

        if let (Some(room_id), Some(old_ci)) = (room_id, freed) {
            fixup_room_links(&mut self.rooms, room_id, old_ci, ci);
        }

        self.clients.send(ci, "RESP RESUME ok=1");

        let Some(room_id) = room_id else { return };
        let Some(room) = self.rooms.get(room_id) else { return };
        let nick = self.clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
        room.broadcast_except(&self.clients, ci, format!("EVT PLAYER_ONLINE nick={nick}"));
        room.send_roster(&self.clients, ci);
        room.send_state(&self.clients, ci);

        if room.phase == room::Phase::Game {
            if let Some(ppos) = room.pos_of(ci) {
                room.send_hand(&self.clients, ppos);
            }
            if let Some(game) = &room.game {
                let top = game.top_card.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
                let suit = game.active_suit.map(|s| s.as_char()).unwrap_or('-');
                self.clients.send(ci, format!("EVT TOP card={top} active_suit={suit} penalty={}", game.penalty));
                let tci = room.players.get(game.turn_pos).copied();
                let tn = tci.and_then(|c| self.clients.get(c)).map(|s| s.identity.nick.clone()).unwrap_or_else(|| "-".to_string());
                self.clients.send(ci, format!("EVT TURN nick={tn}"));
            }
            room::clear_pause_if_resolved(&mut self.clients, &mut self.rooms, room_id);
        }
    }

    fn handle_list_rooms(&mut self, ci: ConnId) {
        if !self.is_logged_in(ci) {
            self.clients.send(ci, err_line("LIST_ROOMS", ErrorCode::NotLogged, "login_first"));
            return;
        }
        let ids: Vec<RoomId> = self.rooms.ids().collect();
        self.clients.send(ci, format!("RESP LIST_ROOMS ok=1 rooms={}", ids.len()));
        for id in ids {
            let Some(r) = self.rooms.get(id) else { continue };
            let state = if r.phase == room::Phase::Game { "GAME" } else { "LOBBY" };
            self.clients.send(
                ci,
                format!("EVT ROOM id={} name={} players={}/{} state={state}", r.id, r.name, r.players.len(), r.size),
            );
        }
    }

    fn handle_create_room(&mut self, ci: ConnId, msg: &Message) {
        if !self.is_logged_in(ci) {
            self.clients.send(ci, err_line("CREATE_ROOM", ErrorCode::NotLogged, "login_first"));
            return;
        }
        if self.clients.get(ci).and_then(|s| s.identity.room_id).is_some() {
            self.clients.send(ci, err_line("CREATE_ROOM", ErrorCode::BadState, "already_in_room"));
            return;
        }
        let (Some(name), Some(size)) = (msg.get("name"), msg.get("size")) else {
            self.clients.send(ci, err_line("CREATE_ROOM", ErrorCode::BadFormat, "missing_fields"));
            return;
        };
        let size: usize = size.parse().unwrap_or(0);

        match room::create_room(&mut self.clients, &mut self.rooms, ci, name, size) {
            Ok(id) => self.clients.send(ci, format!("RESP CREATE_ROOM ok=1 room={id}")),
            Err(code @ ErrorCode::BadFormat) => {
                self.clients.send(ci, err_line("CREATE_ROOM", code, "missing_name"))
            }
            Err(code @ ErrorCode::InvalidValue) => {
                self.clients.send(ci, err_line("CREATE_ROOM", code, "size_2_4"))
            }
            Err(code @ ErrorCode::LimitReached) => {
                self.clients.send(ci, err_line("CREATE_ROOM", code, "max_rooms"))
            }
            Err(code) => self.clients.send(ci, err_line("CREATE_ROOM", code, "rejected")),
        }
    }

    fn handle_join_room(&mut self, ci: ConnId, msg: &Message) {
        if !self.is_logged_in(ci) {
            self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::NotLogged, "login_first"));
            return;
        }
        if self.clients.get(ci).and_then(|s| s.identity.room_id).is_some() {
            self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::BadState, "already_in_room"));
            return;
        }
        let Some(room) = msg.get("room") else {
            self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::BadFormat, "missing_room"));
            return;
        };
        let Ok(room_id) = room.parse::<u32>() else {
            self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::NoSuchRoom, "id"));
            return;
        };

        match room::join_room(&mut self.clients, &mut self.rooms, ci, RoomId(room_id)) {
            Ok(()) => self.clients.send(ci, format!("RESP JOIN_ROOM ok=1 room={room_id}")),
            Err(ErrorCode::NoSuchRoom) => self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::NoSuchRoom, "id")),
            Err(ErrorCode::BadState) => self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::BadState, "game_running")),
            Err(ErrorCode::RoomFull) => self.clients.send(ci, err_line("JOIN_ROOM", ErrorCode::RoomFull, "full")),
            Err(code) => self.clients.send(ci, err_line("JOIN_ROOM", code, "rejected")),
        }
    }

    fn handle_leave_room(&mut self, ci: ConnId) {
        if !self.is_logged_in(ci) {
            self.clients.send(ci, err_line("LEAVE_ROOM", ErrorCode::NotLogged, "login_first"));
            return;
        }
        let Some(room_id) = self.clients.get(ci).and_then(|s| s.identity.room_id) else {
            self.clients.send(ci, err_line("LEAVE_ROOM", ErrorCode::BadState, "not_in_room"));
            return;
        };

        if let Some(slot) = self.clients.get_mut(ci) {
            slot.identity.room_id = None;
            slot.identity.in_game = false;
        }
        room::leave_room(&mut self.clients, &mut self.rooms, ci, room_id);
        self.clients.send(ci, "RESP LEAVE_ROOM ok=1");
    }

    fn handle_start_game(&mut self, ci: ConnId) {
        if !self.is_logged_in(ci) {
            self.clients.send(ci, err_line("START_GAME", ErrorCode::NotLogged, "login_first"));
            return;
        }
        let Some(room_id) = self.clients.get(ci).and_then(|s| s.identity.room_id) else {
            self.clients.send(ci, err_line("START_GAME", ErrorCode::BadState, "not_in_room"));
            return;
        };

        match room::start_game(&mut self.clients, &mut self.rooms, ci, room_id) {
            Ok(()) => self.clients.send(ci, "RESP START_GAME ok=1"),
            Err(ErrorCode::BadState) => self.clients.send(ci, err_line("START_GAME", ErrorCode::BadState, "already_running")),
            Err(ErrorCode::NotHost) => self.clients.send(ci, err_line("START_GAME", ErrorCode::NotHost, "host_only")),
            Err(ErrorCode::NotEnoughPlayers) => {
                self.clients.send(ci, err_line("START_GAME", ErrorCode::NotEnoughPlayers, "need_at_least_two"))
            }
            Err(code) => self.clients.send(ci, err_line("START_GAME", code, "rejected")),
        }
    }

    fn handle_play(&mut self, ci: ConnId, msg: &Message) {
        let Some(room_id) = self.clients.get(ci).and_then(|s| s.identity.room_id) else {
            self.clients.send(ci, err_line("PLAY", ErrorCode::BadState, "no_game"));
            return;
        };
        if self.rooms.get(room_id).map(|r| r.paused).unwrap_or(false) {
            self.clients.send(ci, err_line("PLAY", ErrorCode::Paused, "wait_for_reconnect"));
            return;
        }

        let Some(card_str) = msg.get("card") else {
            self.clients.send(ci, err_line("PLAY", ErrorCode::BadFormat, "missing_card"));
            return;
        };
        let Some(card) = Card::parse(card_str) else {
            self.clients.send(ci, err_line("PLAY", ErrorCode::BadFormat, "bad_card"));
            return;
        };

        let wish = match parse_wish(card, msg.get("wish")) {
            Ok(wish) => wish,
            Err(code) => {
                self.clients.send(ci, err_line("PLAY", code, "rejected"));
                return;
            }
        };

        match room::play(&mut self.clients, &mut self.rooms, ci, room_id, card, wish) {
            Ok(PlayResult::Ended { .. }) | Ok(PlayResult::Continues) => {
                self.clients.send(ci, "RESP PLAY ok=1")
            }
            Err(code) => self.clients.send(ci, err_line("PLAY", code, "rejected")),
        }
    }

    fn handle_draw(&mut self, ci: ConnId) {
        let Some(room_id) = self.clients.get(ci).and_then(|s| s.identity.room_id) else {
            self.clients.send(ci, err_line("DRAW", ErrorCode::BadState, "no_game"));
            return;
        };
        if self.rooms.get(room_id).map(|r| r.paused).unwrap_or(false) {
            self.clients.send(ci, err_line("DRAW", ErrorCode::Paused, "wait_for_reconnect"));
            return;
        }

        match room::draw(&mut self.clients, &mut self.rooms, ci, room_id) {
            Ok(count) => self.clients.send(ci, format!("RESP DRAW ok=1 count={count}")),
            Err(code) => self.clients.send(ci, err_line("DRAW", code, "rejected")),
        }
    }

    fn handle_ping(&mut self, ci: ConnId) {
        if let Some(slot) = self.clients.get_mut(ci) {
            slot.online = true;
            slot.last_seen = std::time::Instant::now();
        }
        self.clients.send(ci, "RESP PONG");
    }

    fn is_logged_in(&self, ci: ConnId) -> bool {
        self.clients.get(ci).map(|s| s.is_logged_in()).unwrap_or(false)
    }

    /// Handles a raw, newly-decoded line: parses it, enforces the `REQ`-only
    /// and strike-on-parse-failure rules, then dispatches. Returns `true` if
    /// the connection accumulated enough strikes to be dropped.
    pub fn handle_line(&mut self, ci: ConnId, line: &str) -> bool {
        let Some(msg) = prsi_core::protocol::parse(line) else {
            let strikes = {
                let Some(slot) = self.clients.get_mut(ci) else { return false };
                slot.strikes += 1;
                slot.strikes
            };
            self.clients.send(ci, err_line("?", ErrorCode::BadFormat, "parse_error"));
            return strikes >= 3;
        };

        if msg.msg_type != MsgType::Req {
            self.clients.send(ci, err_line(&msg.cmd, ErrorCode::BadFormat, "expected_req"));
            return false;
        }

        self.handle_req(ci, &msg);
        false
    }

    pub fn on_disconnect(&mut self, ci: ConnId) {
        let Some(slot) = self.clients.get_mut(ci) else { return };
        slot.online = false;
        slot.last_seen = std::time::Instant::now();
        let Some(room_id) = slot.identity.room_id else { return };

        let nick = self.clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
        if let Some(room) = self.rooms.get(room_id) {
            room.broadcast(&self.clients, format!("EVT PLAYER_OFFLINE nick={nick}"));
        }
        room::pause_for_disconnect(&mut self.clients, &mut self.rooms, room_id, ci);
    }

    /// Periodic maintenance: room pause/resume/abort, then offline-slot
    /// reaping. Driven by the actor's 250ms ticker.
    pub fn tick(&mut self) {
        room::tick_pause_resume_abort(&mut self.clients, &mut self.rooms);

        let expired: Vec<ConnId> = self
            .clients
            .iter()
            .filter(|(_, s)| !s.online && s.last_seen.elapsed().as_secs() > crate::session::OFFLINE_TIMEOUT_SECS)
            .map(|(id, _)| id)
            .collect();

        for ci in expired {
            let room_id = self.clients.get(ci).and_then(|s| s.identity.room_id);
            if let Some(room_id) = room_id {
                room::leave_room_aborting_game(&mut self.clients, &mut self.rooms, ci, room_id, "player_removed");
            }
            self.clients.free(ci);
        }
    }

    /// Idle-connection eviction: an online connection that hasn't sent
    /// anything (not even `PING`) in [`CLIENT_IDLE_TIMEOUT_SECS`] is dropped,
    /// which starts its offline window.
    pub fn idle_eviction_candidates(&self) -> Vec<ConnId> {
        self.clients
            .iter()
            .filter(|(_, s)| s.online && s.last_seen.elapsed().as_secs() > crate::session::CLIENT_IDLE_TIMEOUT_SECS)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Rewrites a room's `players`/`host` entries that referenced the freed old
/// slot so they now point at the resumed connection. Player positions are
/// index-based in the engine, so only the room's `ConnId` bookkeeping needs
/// the swap.
fn fixup_room_links(rooms: &mut room::RoomRegistry, room_id: RoomId, old_ci: ConnId, new_ci: ConnId) {
    let Some(room) = rooms.get_mut(room_id) else { return };
    for p in room.players.iter_mut() {
        if *p == old_ci {
            *p = new_ci;
        }
    }
    if room.host == old_ci {
        room.host = new_ci;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn login_client(server: &mut Server, nick: &str) -> ConnId {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ci = server.clients.alloc(tx).unwrap();
        server.clients.login(ci, nick).unwrap();
        ci
    }

    #[test]
    fn three_strikes_reports_drop_without_freeing_the_slot() {
        let mut server = Server::new(8, 8);
        let ci = login_client(&mut server, "alice");

        assert!(!server.handle_line(ci, "garbage"));
        assert!(!server.handle_line(ci, "also garbage"));
        assert!(server.handle_line(ci, "still garbage"));

        // The caller (the actor) is told to drop the connection, but the
        // slot itself is left for the periodic reaper so room membership
        // stays intact until a proper leave_room/abort_game runs.
        assert!(server.clients.get(ci).is_some());
    }

    #[test]
    fn dropped_connection_mid_game_is_reaped_and_room_stays_consistent() {
        let mut server = Server::new(8, 8);
        let host = login_client(&mut server, "alice");
        let guest = login_client(&mut server, "bob");

        let room_id = room::create_room(&mut server.clients, &mut server.rooms, host, "r", 2).unwrap();
        room::join_room(&mut server.clients, &mut server.rooms, guest, room_id).unwrap();
        room::start_game(&mut server.clients, &mut server.rooms, host, room_id).unwrap();

        // Simulate the actor's response to a 3-strikes drop: mark offline,
        // ask the (absent, in this test) connection task to close, but
        // don't free the slot yet.
        server.on_disconnect(guest);
        assert!(server.clients.get(guest).is_some());
        assert_eq!(server.rooms.get(room_id).unwrap().players.len(), 2);

        // Age the slot past the offline window and let the reaper run.
        server.clients.get_mut(guest).unwrap().last_seen =
            std::time::Instant::now() - std::time::Duration::from_secs(crate::session::OFFLINE_TIMEOUT_SECS + 1);
        server.tick();

        assert!(server.clients.get(guest).is_none());
        let room = server.rooms.get(room_id).unwrap();
        assert_eq!(room.players, vec![host]);
        assert_eq!(room.phase, room::Phase::Lobby);
    }

    #[test]
    fn unknown_command_reports_unknown_cmd() {
        let mut server = Server::new(8, 8);
        let ci = login_client(&mut server, "alice");
        assert!(!server.handle_line(ci, "REQ NOT_A_COMMAND"));
    }

    #[test]
    fn non_req_message_is_rejected_without_strike() {
        let mut server = Server::new(8, 8);
        let ci = login_client(&mut server, "alice");
        assert!(!server.handle_line(ci, "EVT SOMETHING"));
        assert_eq!(server.clients.get(ci).unwrap().strikes, 0);
    }

    #[test]
    fn non_queen_ignores_wish_entirely_even_if_garbage() {
        let ha = Card::parse("HA").unwrap();
        assert_eq!(parse_wish(ha, None), Ok(None));
        assert_eq!(parse_wish(ha, Some("not_a_suit")), Ok(None));
    }

    #[test]
    fn queen_with_no_wish_is_wish_required() {
        let queen = Card::parse("HQ").unwrap();
        assert_eq!(parse_wish(queen, None), Err(ErrorCode::WishRequired));
    }

    #[test]
    fn queen_with_invalid_wish_is_bad_wish_not_wish_required() {
        let queen = Card::parse("HQ").unwrap();
        assert_eq!(parse_wish(queen, Some("Z")), Err(ErrorCode::BadWish));
        assert_eq!(parse_wish(queen, Some("")), Err(ErrorCode::BadWish));
        assert_eq!(parse_wish(queen, Some("SS")), Err(ErrorCode::BadWish));
    }

    #[test]
    fn queen_with_valid_wish_is_accepted() {
        let queen = Card::parse("HQ").unwrap();
        assert_eq!(parse_wish(queen, Some("S")), Ok(Some(prsi_core::card::Suit::Spades)));
    }
}
