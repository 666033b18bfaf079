//! Client slots and the session registry.
//!
//! A slot is split into two field groups living in the same struct: the
//! identity half (nick, session token, room link, in-game flag) and the
//! connection half (outbound sender, strikes, last-seen, online flag).
//! `resume` only ever touches the identity half — see [`ClientSlot::take_identity`]
//! and [`ClientSlot::install_identity`] — so a reconnecting player never
//! inherits a dead socket and a freshly accepted one never loses its own.

use std::time::Instant;

use rand::RngCore;
use tokio::sync::mpsc;

use crate::room::RoomId;

pub const OFFLINE_TIMEOUT_SECS: u64 = 120;
pub const CLIENT_IDLE_TIMEOUT_SECS: u64 = 15;

/// Stable index into the client table. Exposed at the edges (logs, tests)
/// instead of a raw `usize` to keep it distinct from a room id or player
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Nick, session token, and room membership. Empty `nick` means "not logged
/// in"; a present nick always pairs with a present session token.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub nick: String,
    pub session: String,
    pub room_id: Option<RoomId>,
    pub in_game: bool,
}

impl Identity {
    fn is_empty(&self) -> bool {
        self.nick.is_empty()
    }
}

/// A message pushed to a connection's outbound queue. `Close` lets the
/// actor terminate a socket it doesn't itself own (idle eviction,
/// framing errors) without a shared handle to the `TcpStream`.
#[derive(Debug, Clone)]
pub enum Outbound {
    Line(String),
    Close,
}

pub struct ClientSlot {
    pub identity: Identity,

    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub strikes: u32,
    pub last_seen: Instant,
    pub online: bool,
}

impl ClientSlot {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> ClientSlot {
        ClientSlot {
            identity: Identity::default(),
            outbound,
            strikes: 0,
            last_seen: Instant::now(),
            online: true,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !self.identity.is_empty() && !self.identity.session.is_empty()
    }

    /// Sends a line if this slot currently has a live connection. Silently
    /// drops the line otherwise — matches the original's "no outbound error
    /// is possible" stance on write failures.
    pub fn send(&self, line: impl Into<String>) {
        if self.online {
            let _ = self.outbound.send(Outbound::Line(line.into()));
        }
    }

    /// Asks the owning connection task to close the socket.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Takes the identity half out of this slot, leaving an empty one
    /// behind. Used on the old slot during resume.
    fn take_identity(&mut self) -> Identity {
        std::mem::take(&mut self.identity)
    }

    /// Overwrites this slot's identity half, leaving the connection half
    /// (socket, strikes, last-seen, online flag) untouched. Used on the new
    /// slot during resume.
    fn install_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }
}

/// A fresh, unguessable session token: 16 random bytes, hex-encoded.
fn new_session_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// All client slots, indexed by [`ConnId`]. A `None` entry is a free slot.
pub struct ClientTable {
    slots: Vec<Option<ClientSlot>>,
    limit: usize,
}

impl ClientTable {
    pub fn new(limit: usize) -> ClientTable {
        ClientTable {
            slots: Vec::new(),
            limit,
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&ClientSlot> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ClientSlot> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn send(&self, id: ConnId, line: impl Into<String>) {
        if let Some(slot) = self.get(id) {
            slot.send(line);
        }
    }

    /// Allocates a slot for a newly accepted connection. Returns `None`
    /// once the configured client limit is reached; the caller drops the
    /// new TCP connection without a reply in that case.
    pub fn alloc(&mut self, outbound: mpsc::UnboundedSender<Outbound>) -> Option<ConnId> {
        if let Some(i) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[i] = Some(ClientSlot::new(outbound));
            return Some(ConnId(i as u32));
        }
        if self.slots.len() >= self.limit {
            return None;
        }
        self.slots.push(Some(ClientSlot::new(outbound)));
        Some(ConnId((self.slots.len() - 1) as u32))
    }

    pub fn free(&mut self, id: ConnId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn find_by_nick(&self, nick: &str) -> Option<ConnId> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            let s = s.as_ref()?;
            (!s.identity.nick.is_empty() && s.identity.nick == nick).then_some(ConnId(i as u32))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &ClientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (ConnId(i as u32), s)))
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.iter().map(|(id, _)| id)
    }
}

/// Outcome of a login/resume request, used by the dispatcher to decide which
/// wire response to emit.
pub enum LoginError {
    MissingNick,
    NickTooLong,
    NickTakenOnline,
    NickTakenOffline,
}

pub enum ResumeError {
    NoSuchNick,
    BadToken,
    AlreadyOnline,
}

pub const MAX_NICK_LEN: usize = 31;

/// Registry-level operations. These take a `&mut ClientTable` directly
/// rather than a `&mut Server`, since session bookkeeping never needs the
/// room registry except to report which room (if any) a migrated identity
/// belonged to — callers thread that back into room fixups themselves.
impl ClientTable {
    pub fn login(&mut self, ci: ConnId, nick: &str) -> Result<String, LoginError> {
        if let Some(slot) = self.get_mut(ci) {
            slot.online = true;
        }

        if nick.is_empty() {
            return Err(LoginError::MissingNick);
        }
        if nick.len() > MAX_NICK_LEN {
            return Err(LoginError::NickTooLong);
        }

        if let Some(existing) = self.find_by_nick(nick) {
            if existing != ci {
                let online = self.get(existing).map(|s| s.online).unwrap_or(false);
                return Err(if online {
                    LoginError::NickTakenOnline
                } else {
                    LoginError::NickTakenOffline
                });
            }
        }

        let token = new_session_token();
        let slot = self.get_mut(ci).expect("ci is a live connection");
        slot.identity = Identity {
            nick: nick.to_string(),
            session: token.clone(),
            room_id: None,
            in_game: false,
        };
        Ok(token)
    }

    /// Looks up the slot holding `nick` and, if the token matches and it
    /// isn't already online elsewhere, migrates its identity into `ci`.
    /// Returns the migrated identity's prior room (if any) and the freed
    /// slot's id, so the caller can fix up that room's player list.
    pub fn resume(
        &mut self,
        ci: ConnId,
        nick: &str,
        session: &str,
    ) -> Result<(Option<RoomId>, Option<ConnId>), ResumeError> {
        if let Some(slot) = self.get_mut(ci) {
            slot.online = true;
            slot.last_seen = Instant::now();
        }

        let existing = self.find_by_nick(nick).ok_or(ResumeError::NoSuchNick)?;

        if self.get(existing).map(|s| s.identity.session.as_str()) != Some(session) {
            return Err(ResumeError::BadToken);
        }

        if existing != ci && self.get(existing).map(|s| s.online).unwrap_or(false) {
            return Err(ResumeError::AlreadyOnline);
        }

        if existing == ci {
            let room_id = self.get(ci).and_then(|s| s.identity.room_id);
            return Ok((room_id, None));
        }

        let identity = self
            .get_mut(existing)
            .expect("existing came from find_by_nick")
            .take_identity();
        let room_id = identity.room_id;
        self.get_mut(ci)
            .expect("ci is a live connection")
            .install_identity(identity);
        self.free(existing);

        Ok((room_id, Some(existing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one_slot() -> (ClientTable, ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let mut t = ClientTable::new(8);
        let (tx, rx) = mpsc::unbounded_channel();
        let ci = t.alloc(tx).unwrap();
        (t, ci, rx)
    }

    #[test]
    fn login_assigns_nick_and_session() {
        let (mut t, ci, _rx) = table_with_one_slot();
        let token = t.login(ci, "alice").unwrap();
        assert_eq!(token.len(), 32);
        assert!(t.get(ci).unwrap().is_logged_in());
    }

    #[test]
    fn second_login_with_same_nick_while_online_is_rejected() {
        let mut t = ClientTable::new(8);
        let (tx1, _r1) = mpsc::unbounded_channel();
        let (tx2, _r2) = mpsc::unbounded_channel();
        let a = t.alloc(tx1).unwrap();
        let b = t.alloc(tx2).unwrap();
        t.login(a, "alice").unwrap();
        assert!(matches!(t.login(b, "alice"), Err(LoginError::NickTakenOnline)));
    }

    #[test]
    fn resume_migrates_identity_and_frees_old_slot() {
        let mut t = ClientTable::new(8);
        let (tx1, _r1) = mpsc::unbounded_channel();
        let (tx2, _r2) = mpsc::unbounded_channel();
        let old = t.alloc(tx1).unwrap();
        let token = t.login(old, "alice").unwrap();
        t.get_mut(old).unwrap().online = false;

        let new = t.alloc(tx2).unwrap();
        let (_room, freed) = t.resume(new, "alice", &token).unwrap();
        assert_eq!(freed, Some(old));
        assert!(t.get(old).is_none());
        assert_eq!(t.get(new).unwrap().identity.nick, "alice");
        assert!(t.get(new).unwrap().online);
    }

    #[test]
    fn resume_with_wrong_token_fails() {
        let mut t = ClientTable::new(8);
        let (tx1, _r1) = mpsc::unbounded_channel();
        let (tx2, _r2) = mpsc::unbounded_channel();
        let old = t.alloc(tx1).unwrap();
        t.login(old, "alice").unwrap();
        t.get_mut(old).unwrap().online = false;

        let new = t.alloc(tx2).unwrap();
        assert!(matches!(
            t.resume(new, "alice", "wrong"),
            Err(ResumeError::BadToken)
        ));
    }
}
