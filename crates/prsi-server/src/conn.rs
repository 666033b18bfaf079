//! Per-connection task: owns the `TcpStream`, decodes/encodes lines, and
//! forwards everything else to the state actor over a `Command` channel.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::actor::Command;
use crate::codec::{FrameError, LineCodec};
use crate::session::{ConnId, Outbound};

/// Drives one accepted socket until it closes, a framing error occurs, or
/// the actor asks it to close (idle eviction, 3-strikes drop).
pub async fn run(
    ci: ConnId,
    socket: TcpStream,
    peer: std::net::SocketAddr,
    actor: mpsc::UnboundedSender<Command>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut framed = Framed::new(socket, LineCodec);

    let _ = actor.send(Command::Connected { ci, peer });

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(line)) => {
                        if actor.send(Command::Line { ci, text: line }).is_err() {
                            break;
                        }
                    }
                    Some(Err(FrameError::BufferOverflow)) => {
                        let _ = actor.send(Command::FrameError {
                            ci,
                            msg: "ERR ? code=BAD_FORMAT msg=buffer_overflow".to_string(),
                        });
                        break;
                    }
                    Some(Err(FrameError::LineTooLong)) => {
                        let _ = actor.send(Command::FrameError {
                            ci,
                            msg: "ERR ? code=BAD_FORMAT msg=line_too_long".to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = actor.send(Command::Disconnected { ci });
                        break;
                    }
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(Outbound::Line(line)) => {
                        if let Err(e) = framed.send(line).await {
                            warn!(%ci, ?e, "write failed, closing connection");
                            let _ = actor.send(Command::Disconnected { ci });
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        break;
                    }
                }
            }
        }
    }

    debug!(%ci, %peer, "connection task exiting");
}
