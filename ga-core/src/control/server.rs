//! TCP control server.
//!
//! Serves one client connection at a time and feeds every decoded
//! frame to the [`ControlDispatcher`]. Input events bypass the
//! dispatcher and go straight to the replay stage. Everything runs on
//! one task, so the BBR controller has a single writer.
//!
//! The listener keeps accepting while a client is served. A new
//! connection replaces the current one: a receiver that reconnects
//! after a network glitch takes over from its own stale socket.

use std::net::SocketAddr;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ControlCodec;
use crate::control::ControlDispatcher;
use crate::error::GaError;
use crate::message::{ControlMessage, InputEvent};

type ControlStream = Framed<TcpStream, ControlCodec>;

/// The client currently being served.
struct Client {
    peer: SocketAddr,
    framed: ControlStream,
}

enum Event {
    Shutdown,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Frame(Option<Result<ControlMessage, GaError>>),
}

/// Listening control endpoint.
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, GaError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GaError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until `shutdown` is cancelled.
    pub async fn run(
        self,
        mut dispatcher: ControlDispatcher,
        input: Option<mpsc::Sender<InputEvent>>,
        shutdown: CancellationToken,
    ) {
        info!(addr = ?self.listener.local_addr().ok(), "control server listening");
        let mut current: Option<Client> = None;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                accepted = self.listener.accept() => Event::Accepted(accepted),
                frame = next_frame(&mut current) => Event::Frame(frame),
            };

            match event {
                Event::Shutdown => break,
                Event::Accepted(Ok((stream, peer))) => {
                    if let Some(old) = current.take() {
                        info!(peer = %old.peer, "control client replaced by {peer}");
                    }
                    info!(%peer, "control client connected");
                    current = Some(Client {
                        peer,
                        framed: Framed::new(stream, ControlCodec::new()),
                    });
                }
                Event::Accepted(Err(e)) => warn!("control accept failed: {e}"),
                Event::Frame(Some(Ok(ControlMessage::Input(event)))) => {
                    forward_input(event, input.as_ref())
                }
                Event::Frame(Some(Ok(msg))) => dispatcher.dispatch(&msg),
                Event::Frame(Some(Err(e))) => {
                    warn!("control stream error, dropping connection: {e}");
                    disconnect(&mut current);
                }
                Event::Frame(None) => disconnect(&mut current),
            }
        }
        info!("control server stopped");
    }
}

/// Next frame from the current client; never resolves without one.
async fn next_frame(current: &mut Option<Client>) -> Option<Result<ControlMessage, GaError>> {
    match current {
        Some(client) => client.framed.next().await,
        None => std::future::pending().await,
    }
}

fn disconnect(current: &mut Option<Client>) {
    if let Some(client) = current.take() {
        info!(peer = %client.peer, "control client disconnected");
    }
}

fn forward_input(event: InputEvent, input: Option<&mpsc::Sender<InputEvent>>) {
    let Some(tx) = input else {
        debug!("input event received but replay is disabled");
        return;
    };
    // Input is lossy under pressure; never stall the control loop.
    if let Err(e) = tx.try_send(event) {
        debug!("input event dropped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlHandler;
    use crate::message::{BbrReport, ControlSubtype, NetReport};
    use futures::SinkExt;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Record(Arc<Mutex<Vec<ControlMessage>>>);

    impl ControlHandler for Record {
        fn handle(&mut self, msg: &ControlMessage) -> Result<(), GaError> {
            self.0.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn messages_and_input_are_routed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ControlDispatcher::new();
        dispatcher.register(ControlSubtype::NetReport, Box::new(Record(Arc::clone(&seen))));
        let (input_tx, mut input_rx) = mpsc::channel(8);

        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(dispatcher, Some(input_tx), shutdown.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, ControlCodec::new());
        client
            .send(ControlMessage::NetReport(NetReport {
                pktcount: 10,
                ..Default::default()
            }))
            .await
            .unwrap();
        client
            .send(ControlMessage::Input(InputEvent::Key {
                scancode: 4,
                pressed: true,
            }))
            .await
            .unwrap();

        assert_eq!(
            input_rx.recv().await,
            Some(InputEvent::Key {
                scancode: 4,
                pressed: true
            })
        );
        wait_for(|| seen.lock().unwrap().len() == 1).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn new_client_takes_over_from_idle_one() {
        use tokio::io::AsyncReadExt;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ControlDispatcher::new();
        dispatcher.register(ControlSubtype::BbrReport, Box::new(Record(Arc::clone(&seen))));

        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(dispatcher, None, shutdown.clone()));

        // Connects, then never sends anything.
        let mut stale = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, ControlCodec::new());
        for rcvrate in [100, 100, 100] {
            client
                .send(ControlMessage::BbrReport(BbrReport { rcvrate }))
                .await
                .unwrap();
        }
        wait_for(|| seen.lock().unwrap().len() == 3).await;

        // The stale socket was closed by the server.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), stale.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_drops_only_that_connection() {
        use tokio::io::AsyncWriteExt;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ControlDispatcher::new();
        dispatcher.register(ControlSubtype::NetReport, Box::new(Record(Arc::clone(&seen))));

        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(dispatcher, None, shutdown.clone()));

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"NOPE-this-is-not-a-control-frame").await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, ControlCodec::new());
        client
            .send(ControlMessage::NetReport(NetReport::default()))
            .await
            .unwrap();
        wait_for(|| seen.lock().unwrap().len() == 1).await;

        shutdown.cancel();
        task.await.unwrap();
    }
}
