//! Room lifecycle, broadcast primitives, and the in-game compaction that
//! keeps a room's player list and its embedded [`GameState`] consistent
//! when someone leaves mid-game.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use prsi_core::card::{Card, Rank, Suit};
use prsi_core::engine::GameState;
use prsi_core::protocol::ErrorCode;

use crate::session::{ClientTable, ConnId};

pub const OFFLINE_TIMEOUT_SECS: u64 = crate::session::OFFLINE_TIMEOUT_SECS;
const MIN_PLAYERS: usize = 2;
const MAX_PLAYERS: usize = 4;
const CARDS_EACH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(pub u32);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lobby,
    Game,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Lobby => "LOBBY",
            Phase::Game => "GAME",
        }
    }
}

pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub size: usize,
    pub phase: Phase,
    pub paused: bool,
    pub pause_started: Option<Instant>,
    pub players: Vec<ConnId>,
    pub host: ConnId,
    pub game: Option<GameState>,
}

impl Room {
    pub fn pos_of(&self, ci: ConnId) -> Option<usize> {
        self.players.iter().position(|&p| p == ci)
    }

    pub fn broadcast(&self, clients: &ClientTable, line: impl Into<String> + Clone) {
        for &ci in &self.players {
            clients.send(ci, line.clone());
        }
    }

    pub fn broadcast_except(&self, clients: &ClientTable, except: ConnId, line: impl Into<String> + Clone) {
        for &ci in &self.players {
            if ci != except {
                clients.send(ci, line.clone());
            }
        }
    }

    pub fn send_state(&self, clients: &ClientTable, to: ConnId) {
        let (top, active_suit, penalty, turn_nick) = match &self.game {
            Some(g) => {
                let top = g
                    .top_card
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let suit = g
                    .active_suit
                    .map(|s| s.as_char().to_string())
                    .unwrap_or_else(|| "-".to_string());
                let turn_ci = self.players.get(g.turn_pos).copied();
                let turn_nick = turn_ci
                    .and_then(|ci| clients.get(ci))
                    .map(|s| s.identity.nick.clone())
                    .unwrap_or_else(|| "-".to_string());
                (top, suit, g.penalty, turn_nick)
            }
            None => ("-".to_string(), "-".to_string(), 0, "-".to_string()),
        };

        clients.send(
            to,
            format!(
                "EVT STATE room={} phase={} paused={} top={} active_suit={} penalty={} turn={}",
                self.id,
                self.phase.as_str(),
                self.paused as u8,
                top,
                active_suit,
                penalty,
                turn_nick
            ),
        );
    }

    pub fn broadcast_state(&self, clients: &ClientTable) {
        for &ci in &self.players {
            self.send_state(clients, ci);
        }
    }

    pub fn send_roster(&self, clients: &ClientTable, to: ConnId) {
        if let Some(host) = clients.get(self.host) {
            clients.send(to, format!("EVT HOST nick={}", host.identity.nick));
        }
        for &ci in &self.players {
            let Some(slot) = clients.get(ci) else { continue };
            if slot.identity.nick.is_empty() {
                continue;
            }
            clients.send(to, format!("EVT PLAYER_JOIN nick={}", slot.identity.nick));
            let state = if slot.online { "ONLINE" } else { "OFFLINE" };
            clients.send(to, format!("EVT PLAYER_{state} nick={}", slot.identity.nick));
        }
    }

    pub fn send_hand(&self, clients: &ClientTable, ppos: usize) {
        let Some(&ci) = self.players.get(ppos) else { return };
        let Some(game) = &self.game else { return };
        let cards = game
            .hand(ppos)
            .iter()
            .map(Card::to_string)
            .collect::<Vec<_>>()
            .join(",");
        clients.send(ci, format!("EVT HAND cards={cards}"));
    }

    fn turn_nick(&self, clients: &ClientTable) -> String {
        let Some(game) = &self.game else {
            return "-".to_string();
        };
        self.players
            .get(game.turn_pos)
            .and_then(|&ci| clients.get(ci))
            .map(|s| s.identity.nick.clone())
            .unwrap_or_else(|| "-".to_string())
    }

    fn is_active(&self, clients: &ClientTable, ci: ConnId) -> bool {
        clients.get(ci).map(|s| s.online).unwrap_or(false)
    }

    fn any_offline(&self, clients: &ClientTable) -> bool {
        self.players.iter().any(|&ci| !self.is_active(clients, ci))
    }

    fn first_offline(&self, clients: &ClientTable) -> Option<ConnId> {
        self.players.iter().copied().find(|&ci| !self.is_active(clients, ci))
    }
}

pub struct RoomRegistry {
    rooms: HashMap<u32, Room>,
    next_id: u32,
    limit: usize,
}

impl RoomRegistry {
    pub fn new(limit: usize) -> RoomRegistry {
        RoomRegistry {
            rooms: HashMap::new(),
            next_id: 1,
            limit,
        }
    }

    pub fn get(&self, id: RoomId) -> Option<&Room> {
        self.rooms.get(&id.0)
    }

    pub fn get_mut(&mut self, id: RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(&id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = RoomId> + '_ {
        self.rooms.keys().copied().map(RoomId)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }
}

/// Creates a room owned by `ci`, who becomes its host. Requires `ci` to be
/// logged in and not already in a room, checked by the caller (dispatch).
pub fn create_room(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    name: &str,
    size: usize,
) -> Result<RoomId, ErrorCode> {
    if name.is_empty() {
        return Err(ErrorCode::BadFormat);
    }
    if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&size) {
        return Err(ErrorCode::InvalidValue);
    }
    if rooms.len() >= rooms.limit {
        return Err(ErrorCode::LimitReached);
    }

    let id = RoomId(rooms.next_id);
    rooms.next_id += 1;

    rooms.rooms.insert(
        id.0,
        Room {
            id,
            name: name.to_string(),
            size,
            phase: Phase::Lobby,
            paused: false,
            pause_started: None,
            players: vec![ci],
            host: ci,
            game: None,
        },
    );

    clients.get_mut(ci).expect("ci is live").identity.room_id = Some(id);

    let room = rooms.get(id).expect("just inserted");
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
    room.broadcast(clients, format!("EVT PLAYER_JOIN nick={nick}"));
    room.broadcast(clients, format!("EVT HOST nick={nick}"));
    room.broadcast_state(clients);

    Ok(id)
}

pub fn join_room(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    room_id: RoomId,
) -> Result<(), ErrorCode> {
    let room = rooms.get_mut(room_id).ok_or(ErrorCode::NoSuchRoom)?;
    if room.phase != Phase::Lobby {
        return Err(ErrorCode::BadState);
    }
    if room.players.len() >= room.size {
        return Err(ErrorCode::RoomFull);
    }

    room.players.push(ci);
    clients.get_mut(ci).expect("ci is live").identity.room_id = Some(room_id);

    let room = rooms.get(room_id).expect("just joined");
    room.send_roster(clients, ci);
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
    room.broadcast_except(clients, ci, format!("EVT PLAYER_JOIN nick={nick}"));
    room.send_state(clients, ci);
    room.broadcast_state(clients);

    Ok(())
}

/// Removes a client from whatever room it occupies (lobby or mid-game),
/// performing host migration and game-end/abort bookkeeping. `room_id` is
/// the identity's prior room, already cleared by the caller.
pub fn leave_room(clients: &mut ClientTable, rooms: &mut RoomRegistry, ci: ConnId, room_id: RoomId) {
    let Some(room) = rooms.get(room_id) else { return };
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
    room.broadcast(clients, format!("EVT PLAYER_LEAVE nick={nick}"));

    let was_game = room.phase == Phase::Game;
    let ppos = room.pos_of(ci);

    if was_game {
        if let Some(ppos) = ppos {
            remove_player_in_game(clients, rooms, room_id, ppos);
        } else {
            remove_player(clients, rooms, room_id, ci);
        }
    } else {
        remove_player(clients, rooms, room_id, ci);
    }

    let Some(room) = rooms.get(room_id) else { return };

    if was_game {
        if room.players.len() < MIN_PLAYERS {
            if room.players.len() == 1 {
                let winner = room.players[0];
                let wnick = clients.get(winner).map(|s| s.identity.nick.clone());
                if let Some(wnick) = wnick.filter(|n| !n.is_empty()) {
                    room.broadcast(clients, format!("EVT GAME_END winner={wnick}"));
                }
            } else {
                room.broadcast(clients, "EVT GAME_ABORT reason=not_enough_players".to_string());
            }

            let room = rooms.get_mut(room_id).expect("checked above");
            room.phase = Phase::Lobby;
            room.game = None;
            for &p in &room.players.clone() {
                if let Some(slot) = clients.get_mut(p) {
                    slot.identity.in_game = false;
                }
            }
            rooms.get(room_id).expect("checked above").broadcast_state(clients);
            return;
        }

        let room = rooms.get(room_id).expect("checked above");
        for p in 0..room.players.len() {
            room.send_hand(clients, p);
        }
        let turn_nick = room.turn_nick(clients);
        if turn_nick != "-" {
            room.broadcast(clients, format!("EVT TURN nick={turn_nick}"));
        }
        room.broadcast_state(clients);
        return;
    }

    if !room.players.is_empty() {
        room.broadcast_state(clients);
    }
}

/// Removes `ci` from its room, forcibly ending any in-progress game rather
/// than compacting around it. Used by `LOGOUT` and the offline reaper, which
/// — unlike a plain `LEAVE_ROOM` request — always kill the whole game for
/// the remaining players: `PLAYER_LEAVE` is broadcast first, then the game
/// (if any) is aborted with `reason`, then the departing player is removed
/// as a simple roster change. Mirrors `lobby_handle_logout` in the original,
/// which broadcasts `PLAYER_LEAVE`, calls `room_abort_game`, and only then
/// calls the plain `room_remove_player` — never the mid-game compaction path.
pub fn leave_room_aborting_game(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    room_id: RoomId,
    reason: &str,
) {
    let Some(room) = rooms.get(room_id) else { return };
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
    room.broadcast(clients, format!("EVT PLAYER_LEAVE nick={nick}"));

    if room.phase == Phase::Game {
        abort_game(clients, rooms, room_id, reason);
    }

    remove_player(clients, rooms, room_id, ci);

    let Some(room) = rooms.get(room_id) else { return };
    if !room.players.is_empty() {
        room.broadcast_state(clients);
    }
}

fn remove_player(clients: &mut ClientTable, rooms: &mut RoomRegistry, room_id: RoomId, ci: ConnId) {
    let Some(room) = rooms.get_mut(room_id) else { return };
    let Some(pos) = room.pos_of(ci) else { return };
    room.players.remove(pos);

    if room.host == ci && !room.players.is_empty() {
        room.host = room.players[0];
        let nick = clients.get(room.host).map(|s| s.identity.nick.clone()).unwrap_or_default();
        room.broadcast(clients, format!("EVT HOST nick={nick}"));
    }

    if room.players.is_empty() {
        rooms.rooms.remove(&room_id.0);
    }
}

/// Removes a player at `removed_ppos` from an active game: shifts room
/// players and engine hands down by one, fixes up the turn pointer, and
/// migrates host if needed.
fn remove_player_in_game(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    room_id: RoomId,
    removed_ppos: usize,
) {
    let Some(room) = rooms.get_mut(room_id) else { return };
    let removed_ci = room.players[removed_ppos];
    room.players.remove(removed_ppos);
    if let Some(game) = &mut room.game {
        game.remove_player(removed_ppos);
    }

    if room.host == removed_ci && !room.players.is_empty() {
        room.host = room.players[0];
        let nick = clients.get(room.host).map(|s| s.identity.nick.clone()).unwrap_or_default();
        room.broadcast(clients, format!("EVT HOST nick={nick}"));
    }

    if room.players.is_empty() {
        rooms.rooms.remove(&room_id.0);
    }
}

pub fn start_game(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    room_id: RoomId,
) -> Result<(), ErrorCode> {
    let room = rooms.get_mut(room_id).ok_or(ErrorCode::BadState)?;
    if room.phase != Phase::Lobby {
        return Err(ErrorCode::BadState);
    }
    if room.host != ci {
        return Err(ErrorCode::NotHost);
    }
    if room.players.len() < MIN_PLAYERS {
        return Err(ErrorCode::NotEnoughPlayers);
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        ^ room.id.0 as u64;

    let mut game = GameState::init(room.players.len(), seed);
    game.deal(CARDS_EACH);
    game.pick_start_top();

    room.game = Some(game);
    room.phase = Phase::Game;
    room.paused = false;
    room.pause_started = None;
    for &p in &room.players.clone() {
        if let Some(slot) = clients.get_mut(p) {
            slot.identity.in_game = true;
        }
    }

    let room = rooms.get(room_id).expect("just started");
    room.broadcast(clients, format!("EVT GAME_START players={}", room.players.len()));
    for p in 0..room.players.len() {
        room.send_hand(clients, p);
    }
    let game = room.game.as_ref().expect("just set");
    let top = game.top_card.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    let suit = game.active_suit.map(|s| s.as_char()).unwrap_or('-');
    room.broadcast(clients, format!("EVT TOP card={top} active_suit={suit} penalty={}", game.penalty));
    let turn_nick = room.turn_nick(clients);
    room.broadcast(clients, format!("EVT TURN nick={turn_nick}"));
    room.broadcast_state(clients);

    Ok(())
}

pub enum PlayResult {
    Ended { winner_nick: String },
    Continues,
}

pub fn play(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    room_id: RoomId,
    card: Card,
    wish: Option<Suit>,
) -> Result<PlayResult, ErrorCode> {
    let room = rooms.get(room_id).ok_or(ErrorCode::BadState)?;
    if room.paused {
        return Err(ErrorCode::Paused);
    }
    let ppos = room.pos_of(ci).ok_or(ErrorCode::BadState)?;

    let room = rooms.get_mut(room_id).expect("checked above");
    let game = room.game.as_mut().ok_or(ErrorCode::BadState)?;
    let outcome = game.play(ppos, card, wish)?;

    let room = rooms.get(room_id).expect("checked above");
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
    match wish {
        Some(w) if card.rank() == Rank::Queen => {
            room.broadcast(clients, format!("EVT PLAYED nick={nick} card={card} wish={}", w.as_char()));
        }
        _ => room.broadcast(clients, format!("EVT PLAYED nick={nick} card={card}")),
    }

    let game = room.game.as_ref().expect("just played");
    let top = game.top_card.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    let suit = game.active_suit.map(|s| s.as_char()).unwrap_or('-');
    room.broadcast(clients, format!("EVT TOP card={top} active_suit={suit} penalty={}", game.penalty));
    room.send_hand(clients, ppos);

    if let Some(winner_pos) = outcome.winner_pos {
        let winner_ci = room.players[winner_pos];
        let winner_nick = clients.get(winner_ci).map(|s| s.identity.nick.clone()).unwrap_or_default();
        room.broadcast(clients, format!("EVT GAME_END winner={winner_nick}"));

        let room = rooms.get_mut(room_id).expect("checked above");
        room.phase = Phase::Lobby;
        room.paused = false;
        room.pause_started = None;
        room.game = None;
        for &p in &room.players.clone() {
            if let Some(slot) = clients.get_mut(p) {
                slot.identity.in_game = false;
            }
        }
        rooms.get(room_id).expect("checked above").broadcast_state(clients);
        return Ok(PlayResult::Ended { winner_nick });
    }

    let turn_nick = room.turn_nick(clients);
    room.broadcast(clients, format!("EVT TURN nick={turn_nick}"));
    room.broadcast_state(clients);

    Ok(PlayResult::Continues)
}

pub fn draw(
    clients: &mut ClientTable,
    rooms: &mut RoomRegistry,
    ci: ConnId,
    room_id: RoomId,
) -> Result<usize, ErrorCode> {
    let room = rooms.get(room_id).ok_or(ErrorCode::BadState)?;
    if room.paused {
        return Err(ErrorCode::Paused);
    }
    let ppos = room.pos_of(ci).ok_or(ErrorCode::BadState)?;

    let room = rooms.get_mut(room_id).expect("checked above");
    let game = room.game.as_mut().ok_or(ErrorCode::BadState)?;
    let drawn = game.draw(ppos)?;
    let count = drawn.len();

    let room = rooms.get(room_id).expect("checked above");
    room.send_hand(clients, ppos);
    let turn_nick = room.turn_nick(clients);
    room.broadcast(clients, format!("EVT TURN nick={turn_nick}"));
    room.broadcast_state(clients);

    Ok(count)
}

/// Called from the periodic tick for every room in `GAME` phase: enters or
/// clears a pause depending on member online state, and aborts once a pause
/// has outlasted [`OFFLINE_TIMEOUT_SECS`].
pub fn tick_pause_resume_abort(clients: &mut ClientTable, rooms: &mut RoomRegistry) {
    let ids: Vec<RoomId> = rooms.ids().collect();
    for id in ids {
        let Some(room) = rooms.get(id) else { continue };
        if room.phase != Phase::Game {
            continue;
        }

        if room.any_offline(clients) {
            if !room.paused {
                let who = room.first_offline(clients).and_then(|ci| clients.get(ci)).map(|s| s.identity.nick.clone());
                let room = rooms.get_mut(id).expect("checked above");
                room.paused = true;
                room.pause_started = Some(Instant::now());
                let room = rooms.get(id).expect("checked above");
                match who {
                    Some(nick) if !nick.is_empty() => {
                        room.broadcast(clients, format!("EVT GAME_PAUSED nick={nick} timeout={OFFLINE_TIMEOUT_SECS}"));
                    }
                    _ => room.broadcast(clients, format!("EVT GAME_PAUSED timeout={OFFLINE_TIMEOUT_SECS}")),
                }
            }

            let room = rooms.get(id).expect("checked above");
            let expired = room
                .pause_started
                .map(|started| started.elapsed().as_secs() > OFFLINE_TIMEOUT_SECS)
                .unwrap_or(false);
            if expired {
                abort_game(clients, rooms, id, "reconnect_timeout");
            }
        } else if room.paused {
            let room = rooms.get_mut(id).expect("checked above");
            room.paused = false;
            room.pause_started = None;
            rooms.get(id).expect("checked above").broadcast(clients, "EVT GAME_RESUMED".to_string());
            rooms.get(id).expect("checked above").broadcast_state(clients);
        }
    }
}

/// Clears the pause on `room_id` if the just-resumed `ci` was the sole
/// reason it was paused. Called from the resume handler.
pub fn clear_pause_if_resolved(clients: &mut ClientTable, rooms: &mut RoomRegistry, room_id: RoomId) {
    let Some(room) = rooms.get(room_id) else { return };
    if room.phase != Phase::Game || !room.paused || room.any_offline(clients) {
        return;
    }
    let room = rooms.get_mut(room_id).expect("checked above");
    room.paused = false;
    room.pause_started = None;
    rooms.get(room_id).expect("checked above").broadcast(clients, "EVT GAME_RESUMED".to_string());
    rooms.get(room_id).expect("checked above").broadcast_state(clients);
}

pub fn abort_game(clients: &mut ClientTable, rooms: &mut RoomRegistry, room_id: RoomId, reason: &str) {
    let Some(room) = rooms.get_mut(room_id) else { return };
    if room.phase != Phase::Game {
        return;
    }
    room.phase = Phase::Lobby;
    room.paused = false;
    room.pause_started = None;
    room.game = None;

    for &p in &room.players.clone() {
        if let Some(slot) = clients.get_mut(p) {
            slot.identity.in_game = false;
        }
    }

    let room = rooms.get(room_id).expect("checked above");
    room.broadcast(clients, format!("EVT GAME_ABORT reason={reason}"));
    room.broadcast_state(clients);
}

/// Pauses a game because `ci` just went offline, unless it's already paused.
pub fn pause_for_disconnect(clients: &mut ClientTable, rooms: &mut RoomRegistry, room_id: RoomId, ci: ConnId) {
    let Some(room) = rooms.get(room_id) else { return };
    if room.phase != Phase::Game || room.paused {
        return;
    }
    let nick = clients.get(ci).map(|s| s.identity.nick.clone()).unwrap_or_default();

    let room = rooms.get_mut(room_id).expect("checked above");
    room.paused = true;
    room.pause_started = Some(Instant::now());

    let room = rooms.get(room_id).expect("checked above");
    room.broadcast(clients, format!("EVT GAME_PAUSED nick={nick} timeout={OFFLINE_TIMEOUT_SECS}"));
    room.broadcast_state(clients);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn new_client(clients: &mut ClientTable, nick: &str) -> ConnId {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ci = clients.alloc(tx).unwrap();
        clients.login(ci, nick).unwrap();
        ci
    }

    #[test]
    fn create_then_join_fills_room() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 2).unwrap();

        let guest = new_client(&mut clients, "bob");
        join_room(&mut clients, &mut rooms, guest, id).unwrap();

        assert_eq!(rooms.get(id).unwrap().players.len(), 2);
    }

    #[test]
    fn join_full_room_is_rejected() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 2).unwrap();
        let b = new_client(&mut clients, "bob");
        join_room(&mut clients, &mut rooms, b, id).unwrap();
        let c = new_client(&mut clients, "carol");
        assert_eq!(join_room(&mut clients, &mut rooms, c, id), Err(ErrorCode::RoomFull));
    }

    #[test]
    fn host_migrates_when_host_leaves() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 2).unwrap();
        let guest = new_client(&mut clients, "bob");
        join_room(&mut clients, &mut rooms, guest, id).unwrap();

        leave_room(&mut clients, &mut rooms, host, id);
        assert_eq!(rooms.get(id).unwrap().host, guest);
    }

    #[test]
    fn start_game_requires_two_players() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 2).unwrap();
        assert_eq!(
            start_game(&mut clients, &mut rooms, host, id),
            Err(ErrorCode::NotEnoughPlayers)
        );
    }

    #[test]
    fn leaving_mid_game_with_one_left_ends_it() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 2).unwrap();
        let guest = new_client(&mut clients, "bob");
        join_room(&mut clients, &mut rooms, guest, id).unwrap();
        start_game(&mut clients, &mut rooms, host, id).unwrap();

        leave_room(&mut clients, &mut rooms, guest, id);
        let room = rooms.get(id).unwrap();
        assert_eq!(room.phase, Phase::Lobby);
        assert_eq!(room.players, vec![host]);
    }

    /// `logout`/reaper departures always kill the whole game, and must
    /// announce `PLAYER_LEAVE` before `GAME_ABORT` (`spec.md`'s tick/reaper
    /// wording, and `lobby_handle_logout` in the original: `PLAYER_LEAVE`
    /// broadcast, then `room_abort_game`, then plain removal).
    #[test]
    fn aborting_leave_announces_player_leave_before_game_abort() {
        let mut clients = ClientTable::new(8);
        let mut rooms = RoomRegistry::new(8);
        let host = new_client(&mut clients, "alice");
        let id = create_room(&mut clients, &mut rooms, host, "r", 3).unwrap();
        let guest = new_client(&mut clients, "bob");
        join_room(&mut clients, &mut rooms, guest, id).unwrap();

        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel();
        let carol = clients.alloc(carol_tx).unwrap();
        clients.login(carol, "carol").unwrap();
        join_room(&mut clients, &mut rooms, carol, id).unwrap();

        start_game(&mut clients, &mut rooms, host, id).unwrap();
        carol_rx.try_recv().ok(); // drain backlog from create/join/start

        leave_room_aborting_game(&mut clients, &mut rooms, guest, id, "logout");

        let mut saw_leave = false;
        while let Ok(msg) = carol_rx.try_recv() {
            let crate::session::Outbound::Line(line) = msg else { continue };
            if line.starts_with("EVT PLAYER_LEAVE") {
                saw_leave = true;
            }
            if line.starts_with("EVT GAME_ABORT") {
                assert!(saw_leave, "GAME_ABORT must not precede PLAYER_LEAVE");
            }
        }
        assert!(saw_leave, "expected a PLAYER_LEAVE broadcast");

        let room = rooms.get(id).unwrap();
        assert_eq!(room.phase, Phase::Lobby);
        assert_eq!(room.players, vec![host, carol]);
    }
}
