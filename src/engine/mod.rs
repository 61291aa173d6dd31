//! Tunnel Engines
//!
//! Both engines run three tasks over a shared TUN device and UDP transport:
//! one relay per direction and one waiting for the stop signal. The first
//! task to finish reports into a [`Completion`], which cancels the others;
//! the engine then closes its handles and joins the tasks.

pub mod client;
pub mod server;

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub use client::{ClientEngine, ClientOptions, ClientState};
pub use server::{ServerEngine, ServerOptions};

/// Why an engine stopped
#[derive(Debug)]
pub enum Termination {
    /// Graceful stop, with the signal that caused it
    Signal(String),
    /// A task hit a fatal error
    Failed(Error),
}

impl Termination {
    pub fn into_result(self) -> Result<()> {
        match self {
            Termination::Signal(_) => Ok(()),
            Termination::Failed(e) => Err(e),
        }
    }
}

struct CompletionInner {
    slot: Mutex<Option<oneshot::Sender<Termination>>>,
    token: CancellationToken,
}

/// Single-slot termination signal shared by an engine's tasks.
///
/// Only the first report is delivered; later ones are discarded.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new() -> (Self, oneshot::Receiver<Termination>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            inner: Arc::new(CompletionInner {
                slot: Mutex::new(Some(tx)),
                token: CancellationToken::new(),
            }),
        };
        (completion, rx)
    }

    /// Report a termination. Returns `true` if this was the first report.
    pub fn report(&self, termination: Termination) -> bool {
        let sender = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(sender) = sender else {
            debug!("Discarding late termination: {:?}", termination);
            return false;
        };
        // The receiver may already be gone if the engine future was dropped
        let _ = sender.send(termination);
        self.inner.token.cancel();
        true
    }

    /// Token cancelled once the first report is in
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

/// Run a relay loop until it fails or the engine is cancelled
pub(crate) fn spawn_relay<F>(name: &'static str, completion: Completion, relay: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let token = completion.token();
        tokio::select! {
            _ = token.cancelled() => {
                debug!("{} relay cancelled", name);
            }
            result = relay => {
                // Relay loops only return on error
                let err = result.err().unwrap_or(Error::Closed);
                let lost_device = err.is_transport();
                if completion.report(Termination::Failed(err)) {
                    if lost_device {
                        warn!("{} relay lost its device or socket", name);
                    } else {
                        warn!("{} relay stopped on a fatal error", name);
                    }
                }
            }
        }
    })
}

/// Wait for `stop` and report it as a graceful termination
pub(crate) fn spawn_signal<S>(completion: Completion, stop: S) -> JoinHandle<()>
where
    S: Future<Output = String> + Send + 'static,
{
    tokio::spawn(async move {
        let token = completion.token();
        tokio::select! {
            _ = token.cancelled() => {}
            reason = stop => {
                if completion.report(Termination::Signal(reason.clone())) {
                    info!("{} received, shutting down", reason);
                }
            }
        }
    })
}

/// Wait for the first termination
pub(crate) async fn first_termination(done: oneshot::Receiver<Termination>) -> Termination {
    match done.await {
        Ok(termination) => termination,
        // Every task exited without reporting
        Err(_) => Termination::Failed(Error::Closed),
    }
}

/// Log a termination the way the binary reports it
pub(crate) fn log_termination(role: &str, termination: &Termination) {
    match termination {
        Termination::Signal(reason) => info!("{} stopped by {}", role, reason),
        Termination::Failed(e) => error!("{} failed: {}", role, e),
    }
}

/// Resolve on SIGINT or SIGTERM, returning the signal name
pub async fn wait_for_signal() -> String {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => ctrl_c_reason(result).await,
                _ = terminate.recv() => "SIGTERM".to_string(),
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c_reason(tokio::signal::ctrl_c().await).await
        }
    }
}

async fn ctrl_c_reason(result: std::io::Result<()>) -> String {
    if let Err(e) = result {
        warn!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    "SIGINT".to_string()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;
    use crate::crypto::Cipher;
    use crate::device::memory::{tun_pair, MemoryNetwork, MemoryTunFactory};
    use crate::device::Transport;
    use crate::packet::build_udp;
    use crate::protocol::{FrameCodec, Kind, Message};
    use crate::route::tests::{RecordingRouter, RouteCall, PREVIOUS_RESOLVER};

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 88, 1);
    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 88, 2);
    const SERVER_REAL: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 8964);
    const LAN_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn stop_pair() -> (oneshot::Sender<()>, impl Future<Output = String> + Send + 'static) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
            "test stop".to_string()
        })
    }

    #[test]
    fn test_first_report_wins() {
        let (completion, mut done) = Completion::new();
        let other = completion.clone();

        assert!(completion.report(Termination::Failed(Error::Closed)));
        assert!(!other.report(Termination::Signal("SIGINT".into())));
        assert!(other.is_done());
        assert!(completion.token().is_cancelled());

        match done.try_recv().unwrap() {
            Termination::Failed(Error::Closed) => {}
            other => panic!("unexpected termination: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_relay_cancels_the_rest() {
        let (completion, done) = Completion::new();
        let (_keep, stop) = stop_pair();

        let failing = spawn_relay("failing", completion.clone(), async {
            Err(Error::Device("boom".into()))
        });
        let idle = spawn_relay("idle", completion.clone(), std::future::pending());
        let signal = spawn_signal(completion.clone(), stop);

        let termination = timeout(Duration::from_secs(1), first_termination(done)).await.unwrap();
        assert!(matches!(termination, Termination::Failed(Error::Device(_))));
        for handle in [failing, idle, signal] {
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let network = MemoryNetwork::new();
        let server_transport = network.bind(SocketAddr::V4(SERVER_REAL));
        let client_transport = network.bind("203.0.113.10:40000".parse().unwrap());
        let (server_tun, mut server_io) = tun_pair("srv0");
        let (client_tun, mut client_io) = tun_pair("cli0");
        let cipher = Cipher::from_secret("e2e secret");

        let server = ServerEngine::bind(
            ServerOptions { local_ip: SERVER_IP, nat_address: None, dns: Some(SERVER_IP), compress: true },
            cipher.clone(),
            &MemoryTunFactory::new(server_tun),
            server_transport,
        )
        .await
        .unwrap();
        let sessions = server.sessions();
        let (server_stop_tx, server_stop) = stop_pair();
        let server_task = tokio::spawn(server.run(server_stop));

        let router = Arc::new(RecordingRouter::new(LAN_GATEWAY));
        let client = ClientEngine::new(
            ClientOptions {
                server: SERVER_REAL,
                handshake_timeout: Duration::from_millis(200),
                default_route: true,
                compress: true,
            },
            cipher,
            client_transport.clone(),
            Arc::new(MemoryTunFactory::new(client_tun.clone())),
            router.clone(),
        );
        let (client_stop_tx, client_stop) = stop_pair();
        let client_task = tokio::spawn(client.run(client_stop));

        let outbound = build_udp(CLIENT_IP, 5000, SERVER_IP, 53, b"hello through the tunnel");
        client_io.inject.send(outbound.clone()).unwrap();
        let received = timeout(Duration::from_secs(2), server_io.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, outbound);
        assert_eq!(sessions.lookup(CLIENT_IP).await.unwrap(), client_transport.local_addr().unwrap());

        let inbound = build_udp(SERVER_IP, 53, CLIENT_IP, 5000, b"and back again");
        server_io.inject.send(inbound.clone()).unwrap();
        let received = timeout(Duration::from_secs(2), client_io.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, inbound);

        client_stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), client_task).await.unwrap().unwrap().unwrap();
        assert!(client_tun.is_closed());
        assert!(client_transport.is_closed());
        assert_eq!(
            router.calls(),
            vec![
                RouteCall::Pin { gateway: LAN_GATEWAY, host: *SERVER_REAL.ip() },
                RouteCall::ClearDefault,
                RouteCall::SetDefault(SERVER_IP),
                RouteCall::SetDns(SERVER_IP),
                RouteCall::RestoreDns(PREVIOUS_RESOLVER.to_string()),
                RouteCall::ClearDefault,
                RouteCall::SetDefault(LAN_GATEWAY),
                RouteCall::Unpin(*SERVER_REAL.ip()),
            ]
        );

        server_stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), server_task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_drops_bad_input_and_keeps_serving() {
        let network = MemoryNetwork::new();
        let server_transport = network.bind(SocketAddr::V4(SERVER_REAL));
        let peer = network.bind("203.0.113.20:50000".parse().unwrap());
        let (server_tun, mut server_io) = tun_pair("srv0");
        let cipher = Cipher::from_secret("drop test");
        let mut codec = FrameCodec::new(cipher.clone());

        let server = ServerEngine::bind(
            ServerOptions { local_ip: SERVER_IP, nat_address: None, dns: None, compress: false },
            cipher,
            &MemoryTunFactory::new(server_tun),
            server_transport,
        )
        .await
        .unwrap();
        let (stop_tx, stop) = stop_pair();
        let server_task = tokio::spawn(server.run(stop));
        let server_addr = SocketAddr::V4(SERVER_REAL);

        // Garbage, a frame sealed with another secret and a stray Accept
        peer.send_to(b"definitely not a frame", server_addr).await.unwrap();
        let mut foreign = FrameCodec::new(Cipher::from_secret("someone else"));
        peer.send_to(&foreign.seal(Message::request()).unwrap(), server_addr).await.unwrap();
        peer.send_to(&codec.seal(Message::accept(CLIENT_IP)).unwrap(), server_addr).await.unwrap();

        peer.send_to(&codec.seal(Message::request()).unwrap(), server_addr).await.unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        let accept = codec.open(&buf[..len]).unwrap();
        assert_eq!(accept.kind(), Kind::Accept);
        assert_eq!(accept.assigned_address(), Some(CLIENT_IP));

        // Nobody holds .77, the packet for .2 must still get through
        let stray = build_udp(SERVER_IP, 53, Ipv4Addr::new(192, 168, 88, 77), 53, b"lost");
        let wanted = build_udp(SERVER_IP, 53, CLIENT_IP, 5000, b"found");
        server_io.inject.send(stray).unwrap();
        server_io.inject.send(b"\x60not ipv4".to_vec()).unwrap();
        server_io.inject.send(wanted.clone()).unwrap();

        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        let data = codec.open(&buf[..len]).unwrap();
        assert_eq!(data.kind(), Kind::Data);
        assert_eq!(data.payload(), &Bytes::from(wanted));

        stop_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(2), server_task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(server_io.written.try_recv().is_err());
    }
}
