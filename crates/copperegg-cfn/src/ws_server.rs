// WebSocket ingress: the event source connects here and pushes one job per
// text frame. Frames are parsed into `Payload`s before they reach the
// dispatch loop, so the loop only ever sees typed jobs or a typed rejection.

use std::net::SocketAddr;

use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::protocol::Payload;

/// Events emitted by the WebSocket server to the dispatch loop.
#[derive(Debug, PartialEq)]
pub enum WsEvent {
    Connected { addr: SocketAddr },
    Disconnected { addr: SocketAddr },
    /// A text frame that parsed as a job payload.
    Job(Payload),
    /// A text frame that was not a job payload.
    Malformed { addr: SocketAddr, error: String },
}

/// Bind the listener on `127.0.0.1:{port}`. Port 0 picks a free port.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("WebSocket server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve event sources one at a time until the dispatch loop goes away or
/// the listener fails.
pub async fn run(listener: TcpListener, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    while !tx.is_closed() {
        let (stream, addr) = listener.accept().await?;
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%addr, "WebSocket handshake failed: {e}");
                continue;
            }
        };

        let open = tx.send(WsEvent::Connected { addr }).await.is_ok()
            && forward_jobs(ws, addr, &tx).await
            && tx.send(WsEvent::Disconnected { addr }).await.is_ok();
        if !open {
            break;
        }
    }

    debug!("Dispatch loop gone, WebSocket server stopping");
    Ok(())
}

/// How one inbound frame affects the job stream.
enum Frame {
    Event(WsEvent),
    Ignored,
    Hangup,
}

fn read_frame(frame: Result<Message, WsError>, addr: SocketAddr) -> Frame {
    match frame {
        Ok(Message::Text(text)) => Frame::Event(match Payload::from_json(text.as_str()) {
            Ok(payload) => WsEvent::Job(payload),
            Err(e) => WsEvent::Malformed {
                addr,
                error: e.to_string(),
            },
        }),
        Ok(Message::Close(_)) => {
            info!(%addr, "Event source closed the connection");
            Frame::Hangup
        }
        // Jobs only travel as text.
        Ok(_) => Frame::Ignored,
        Err(e) => {
            warn!(%addr, "WebSocket read failed: {e}");
            Frame::Hangup
        }
    }
}

/// Forward the jobs carried by one connection's frames. Returns `false` once
/// the dispatch loop has dropped its receiver.
pub async fn forward_jobs<St>(
    mut frames: St,
    addr: SocketAddr,
    tx: &mpsc::Sender<WsEvent>,
) -> bool
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match read_frame(frame, addr) {
            Frame::Event(event) => {
                if tx.send(event).await.is_err() {
                    return false;
                }
            }
            Frame::Ignored => {}
            Frame::Hangup => break,
        }
    }
    true
}
