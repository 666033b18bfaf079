//! The single-owner state actor. All [`crate::dispatch::Server`] mutation
//! happens on one task via this command queue — no `Mutex`, no `RwLock`.
//! Per-connection tasks and the ticker only ever hold a
//! [`mpsc::UnboundedSender<Command>`].

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dispatch::Server;
use crate::session::{ConnId, Outbound};

pub enum Command {
    /// Allocates a client slot for a newly accepted socket. `None` on reply
    /// means the client limit was reached; the acceptor drops the socket.
    Accept {
        reply: oneshot::Sender<Option<(ConnId, mpsc::UnboundedReceiver<Outbound>)>>,
    },
    Connected {
        ci: ConnId,
        peer: std::net::SocketAddr,
    },
    Line {
        ci: ConnId,
        text: String,
    },
    FrameError {
        ci: ConnId,
        msg: String,
    },
    Disconnected {
        ci: ConnId,
    },
    Tick,
    Shutdown,
}

/// Runs the actor loop until a [`Command::Shutdown`] is received or the
/// channel closes. Owns the only `&mut Server` in the process.
pub async fn run(mut server: Server, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("state actor started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Accept { reply } => {
                let (tx, out_rx) = mpsc::unbounded_channel();
                let allocated = server.clients.alloc(tx).map(|ci| (ci, out_rx));
                let _ = reply.send(allocated);
            }
            Command::Connected { ci, peer } => {
                debug!(%ci, %peer, "connection accepted");
                server.clients.send(ci, "EVT SERVER msg=welcome");
            }
            Command::Line { ci, text } => {
                let drop = server.handle_line(ci, &text);
                if drop {
                    warn!(%ci, "dropping connection after repeated malformed lines");
                    if let Some(slot) = server.clients.get(ci) {
                        slot.close();
                    }
                    server.on_disconnect(ci);
                }
            }
            Command::FrameError { ci, msg } => {
                server.clients.send(ci, msg);
                if let Some(slot) = server.clients.get(ci) {
                    slot.close();
                }
                server.on_disconnect(ci);
            }
            Command::Disconnected { ci } => {
                debug!(%ci, "connection closed");
                server.on_disconnect(ci);
            }
            Command::Tick => {
                server.tick();
                for ci in server.idle_eviction_candidates() {
                    debug!(%ci, "idle timeout, closing connection");
                    server.clients.send(ci, "EVT SERVER msg=idle_timeout");
                    if let Some(slot) = server.clients.get(ci) {
                        slot.close();
                    }
                }
            }
            Command::Shutdown => {
                info!("state actor shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn accept(
        tx: &mpsc::UnboundedSender<Command>,
    ) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let (reply, reply_rx) = oneshot::channel();
        tx.send(Command::Accept { reply }).unwrap();
        reply_rx.await.unwrap().expect("client slot available")
    }

    async fn next_line(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        match rx.recv().await.expect("outbound channel closed") {
            Outbound::Line(line) => line,
            Outbound::Close => panic!("expected a line, got Close"),
        }
    }

    /// Broadcasts (`EVT ...`) are flushed to the room before the `RESP`/`ERR`
    /// that acknowledges the triggering request (see `spec.md` §5's ordering
    /// guarantee), so callers that only care about the acknowledgement drain
    /// past any leading `EVT` lines.
    async fn next_ack(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        loop {
            let line = next_line(rx).await;
            if !line.starts_with("EVT ") {
                return line;
            }
        }
    }

    #[tokio::test]
    async fn login_create_join_start_flow_over_the_actor() {
        let server = Server::new(8, 8);
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let handle = tokio::spawn(run(server, rx));

        let peer: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();

        let (host, mut host_out) = accept(&tx).await;
        tx.send(Command::Connected { ci: host, peer }).unwrap();
        assert_eq!(next_line(&mut host_out).await, "EVT SERVER msg=welcome");

        tx.send(Command::Line { ci: host, text: "REQ LOGIN nick=alice".to_string() }).unwrap();
        let resp = next_ack(&mut host_out).await;
        assert!(resp.starts_with("RESP LOGIN ok=1 session="));

        tx.send(Command::Line {
            ci: host,
            text: "REQ CREATE_ROOM name=table size=2".to_string(),
        })
        .unwrap();
        assert_eq!(next_ack(&mut host_out).await, "RESP CREATE_ROOM ok=1 room=1");

        let (guest, mut guest_out) = accept(&tx).await;
        tx.send(Command::Connected { ci: guest, peer }).unwrap();
        assert_eq!(next_line(&mut guest_out).await, "EVT SERVER msg=welcome");
        tx.send(Command::Line { ci: guest, text: "REQ LOGIN nick=bob".to_string() }).unwrap();
        assert!(next_ack(&mut guest_out).await.starts_with("RESP LOGIN ok=1"));

        tx.send(Command::Line { ci: guest, text: "REQ JOIN_ROOM room=1".to_string() }).unwrap();
        assert_eq!(next_ack(&mut guest_out).await, "RESP JOIN_ROOM ok=1 room=1");

        tx.send(Command::Line { ci: host, text: "REQ START_GAME".to_string() }).unwrap();
        assert_eq!(next_ack(&mut host_out).await, "RESP START_GAME ok=1");

        tx.send(Command::Shutdown).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_line_increments_strikes_and_third_closes_the_socket() {
        let server = Server::new(8, 8);
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let handle = tokio::spawn(run(server, rx));

        let peer: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (ci, mut out) = accept(&tx).await;
        tx.send(Command::Connected { ci, peer }).unwrap();
        assert_eq!(next_line(&mut out).await, "EVT SERVER msg=welcome");

        for _ in 0..2 {
            tx.send(Command::Line { ci, text: "garbage".to_string() }).unwrap();
            assert_eq!(next_line(&mut out).await, "ERR ? code=BAD_FORMAT msg=parse_error");
        }

        tx.send(Command::Line { ci, text: "garbage".to_string() }).unwrap();
        assert_eq!(next_line(&mut out).await, "ERR ? code=BAD_FORMAT msg=parse_error");
        match out.recv().await.expect("channel closed before Close") {
            Outbound::Close => {}
            Outbound::Line(l) => panic!("expected Close, got line {l}"),
        }

        tx.send(Command::Shutdown).unwrap();
        handle.await.unwrap();
    }
}
