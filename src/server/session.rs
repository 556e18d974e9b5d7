// src/server/session.rs

//! Per-connection I/O task: frames the socket as newline-delimited JSON and
//! forwards decoded requests to the reactor task over an mpsc channel. Owns
//! no server state beyond its own socket and outbox — the reactor is the
//! only task permitted to mutate the job/machine tables.

use crate::protocol::{JsonLineCodec, Request};
use crate::server::reactor::{ReactorEvent, ToClient};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Spawns the connection's I/O task and returns the sender half of its
/// outbox, which the reactor registers under this connection's session id.
pub fn spawn(
    stream: TcpStream,
    addr: SocketAddr,
    session_id: u64,
    to_reactor: mpsc::UnboundedSender<ReactorEvent>,
) -> mpsc::UnboundedSender<ToClient> {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ToClient>();
    tokio::spawn(async move {
        let mut framed = Framed::new(stream, JsonLineCodec);
        loop {
            tokio::select! {
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(value)) => match serde_json::from_value::<Request>(value) {
                            Ok(request) => {
                                if to_reactor.send(ReactorEvent::Request { session_id, request }).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(session_id, %addr, error = %e, "malformed request line");
                                let _ = to_reactor.send(ReactorEvent::Disconnect { session_id });
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            debug!(session_id, %addr, error = %e, "decode error");
                            let _ = to_reactor.send(ReactorEvent::Disconnect { session_id });
                            break;
                        }
                        None => {
                            let _ = to_reactor.send(ReactorEvent::Disconnect { session_id });
                            break;
                        }
                    }
                }
                outgoing = outbox_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if framed.send(msg.into_value()).await.is_err() {
                                let _ = to_reactor.send(ReactorEvent::Disconnect { session_id });
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        info!(session_id, %addr, "connection closed");
    });
    outbox_tx
}
