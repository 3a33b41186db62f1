//! Connection supervision: the accept loop, per-connection drivers, and the
//! table of bound sessions.
//!
//! Each accepted connection gets its own task owning a `FrameReader`, a
//! `Session`, and the write half of the socket. The driver enforces the
//! handshake and idle deadlines, feeds decoded stanzas through the shared
//! `Router`, and applies the control actions the router returns. One
//! misbehaving or dead connection never affects its siblings: every failure
//! path ends in that task returning and its guard dropping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::framing::{Frame, FrameReader};
use crate::router::{Control, QueryRegistry, Router};
use crate::session::{Session, SessionState};
use crate::stanza::Stanza;

/// Outbound stanzas queued per bound session before backpressure kicks in.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

struct SessionEntry {
    conn_id: u64,
    outbound: mpsc::Sender<Stanza>,
}

/// Shared map from bound full address to the owning connection's outbound
/// queue. This is the process-internal delivery hook: anything holding a
/// clone can push stanzas to a bound session by address.
#[derive(Clone, Default)]
pub struct SessionTable {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` as owned by `conn_id`. A duplicate bind replaces
    /// the previous owner: the newest binding wins, and the old session is
    /// simply no longer addressable.
    async fn register(&self, address: &str, conn_id: u64, outbound: mpsc::Sender<Stanza>) {
        let mut entries = self.entries.write().await;
        if let Some(previous) = entries.insert(
            address.to_string(),
            SessionEntry { conn_id, outbound },
        ) {
            warn!(
                address = %address,
                old_conn_id = previous.conn_id,
                new_conn_id = conn_id,
                "duplicate bind, newest session takes over the address"
            );
        }
    }

    /// Remove `address` only if `conn_id` still owns it. A session displaced
    /// by a duplicate bind must not unregister its successor on the way out.
    async fn deregister(&self, address: &str, conn_id: u64) {
        let mut entries = self.entries.write().await;
        if entries.get(address).is_some_and(|e| e.conn_id == conn_id) {
            entries.remove(address);
        }
    }

    /// Queue `stanza` for delivery on the session bound to `address`.
    ///
    /// `ConnectionClosed` when no session is bound there or its driver has
    /// already gone away.
    pub async fn send_to(&self, address: &str, stanza: Stanza) -> EngineResult<()> {
        let outbound = {
            let entries = self.entries.read().await;
            match entries.get(address) {
                Some(entry) => entry.outbound.clone(),
                None => return Err(EngineError::ConnectionClosed),
            }
        };
        outbound
            .send(stanza)
            .await
            .map_err(|_| EngineError::ConnectionClosed)
    }

    /// Whether any session is currently bound to `address`.
    pub async fn is_bound(&self, address: &str) -> bool {
        self.entries.read().await.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// RAII active-connection counter: increments on accept, decrements when the
/// driver task ends for any reason.
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn write_stanzas<W>(writer: &mut W, stanzas: &[Stanza]) -> EngineResult<()>
where
    W: AsyncWrite + Unpin,
{
    for stanza in stanzas {
        writer.write_all(stanza.encode().as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Owns the listener loop and the shared per-connection machinery.
pub struct Supervisor {
    config: Arc<EngineConfig>,
    router: Arc<Router>,
    sessions: SessionTable,
    active: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        authenticator: Arc<dyn Authenticator>,
        queries: QueryRegistry,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let router = Arc::new(Router::new(
            config.clone(),
            authenticator,
            Arc::new(queries),
        ));
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            router,
            sessions: SessionTable::new(),
            active: Arc::new(AtomicUsize::new(0)),
            next_conn_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// The delivery hook for bound sessions.
    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal every driver task and the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Accept connections on `listener` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(addr = ?listener.local_addr().ok(), "supervisor accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "accepted connection");
                            self.attach(stream);
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("supervisor shutting down");
                    break;
                }
            }
        }
    }

    /// Hand an established byte channel to its own driver task. Used by the
    /// accept loop and directly by callers with pre-established transports.
    pub fn attach<S>(self: &Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let supervisor = self.clone();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _guard = ConnectionGuard::new(supervisor.active.clone());
            info!(conn_id, "session driver started");
            match supervisor.drive(stream, conn_id).await {
                Ok(()) => info!(conn_id, "session driver finished"),
                Err(e) if e.is_fatal() => info!(conn_id, error = %e, "session ended"),
                Err(e) => warn!(conn_id, error = %e, "session driver failed"),
            }
        })
    }

    async fn drive<S>(&self, stream: S, conn_id: u64) -> EngineResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.max_frame_buffer);
        let mut session = Session::new(self.config.domain.clone());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let mut shutdown_rx = self.shutdown.subscribe();
        // Total budget from accept to establishment; the idle deadline rolls
        // with activity, the handshake deadline does not
        let handshake_deadline = Instant::now() + self.config.handshake_timeout;

        // Every exit goes through `break` so the post-loop cleanup always
        // runs: a dead driver must never leave its address registered
        let result = loop {
            let established = session.state() == SessionState::Established;
            tokio::select! {
                inbound = async {
                    if established {
                        timeout(self.config.idle_timeout, reader.next_frame()).await
                    } else {
                        timeout_at(handshake_deadline, reader.next_frame()).await
                    }
                } => {
                    let tagged = match inbound {
                        Err(_elapsed) => {
                            info!(conn_id, state = ?session.state(), "session deadline expired");
                            let _ = writer.write_all(b"</stream:stream>").await;
                            break Err(EngineError::Timeout);
                        }
                        Ok(Err(e)) => break Err(e),
                        Ok(Ok(tagged)) => tagged,
                    };
                    let raw = match tagged.frame {
                        Frame::StreamClose => {
                            info!(conn_id, "peer closed the stream");
                            let _ = writer.write_all(b"</stream:stream>").await;
                            break Ok(());
                        }
                        Frame::StreamOpen(raw) | Frame::Element(raw) => raw,
                    };
                    let stanza = match Stanza::decode(&raw) {
                        Ok(stanza) => stanza,
                        Err(e) => break Err(e),
                    };

                    let was_bound = session.state() == SessionState::Bound
                        || session.state() == SessionState::Established;
                    let routed = match self.router.route(&mut session, stanza).await {
                        Ok(routed) => routed,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = write_stanzas(&mut writer, &routed.reply).await {
                        break Err(e);
                    }

                    if !was_bound && session.state() == SessionState::Bound {
                        if let Some(address) = session.full_address() {
                            self.sessions
                                .register(&address, conn_id, outbound_tx.clone())
                                .await;
                        }
                    }

                    match routed.control {
                        Some(Control::RestartStream) => reader.restart(),
                        Some(Control::Close) => {
                            let _ = writer.write_all(b"</stream:stream>").await;
                            break Err(EngineError::ProtocolOrder(
                                "order violation limit reached".to_string(),
                            ));
                        }
                        None => {}
                    }
                }
                delivery = outbound_rx.recv() => {
                    // The table holds a sender clone while this address is
                    // registered, so recv only ever yields Some here
                    if let Some(stanza) = delivery {
                        if let Err(e) = write_stanzas(&mut writer, std::slice::from_ref(&stanza)).await {
                            break Err(e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(conn_id, "closing session on shutdown");
                    let _ = writer.write_all(b"</stream:stream>").await;
                    break Ok(());
                }
            }
        };

        session.close();
        if let Some(address) = session.full_address() {
            self.sessions.deregister(&address, conn_id).await;
        }
        let _ = writer.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuthenticator;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Route engine tracing into the captured per-test output, honoring
    /// `RUST_LOG`.
    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_supervisor(config: EngineConfig) -> Arc<Supervisor> {
        trace_init();
        Supervisor::new(
            config,
            Arc::new(MemoryAuthenticator::new().with_user("james", "sekret")),
            QueryRegistry::new(),
        )
    }

    async fn serve_on_loopback(supervisor: Arc<Supervisor>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(supervisor.serve(listener));
        addr
    }

    /// Read from `stream` until the collected text contains `marker`.
    async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
        let mut collected = String::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("timed out waiting for server output")
                .unwrap();
            assert!(n > 0, "connection closed while waiting for {marker:?}");
            collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
            if collected.contains(marker) {
                return collected;
            }
        }
    }

    fn stream_header() -> &'static [u8] {
        b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
          xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='1.0'>"
    }

    fn plain_auth(user: &str, password: &str) -> String {
        let blob = BASE64.encode(format!("\0{user}\0{password}"));
        format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{blob}</auth>")
    }

    /// Drive a client through the full negotiation, ending bound and
    /// established as `user@localhost/resource`.
    async fn negotiate(stream: &mut TcpStream, user: &str, password: &str, resource: &str) {
        stream.write_all(stream_header()).await.unwrap();
        read_until(stream, "PLAIN").await;

        stream
            .write_all(plain_auth(user, password).as_bytes())
            .await
            .unwrap();
        read_until(stream, "<success").await;

        stream.write_all(stream_header()).await.unwrap();
        read_until(stream, "xmpp-bind").await;

        let bind = format!(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{resource}</resource></bind></iq>"
        );
        stream.write_all(bind.as_bytes()).await.unwrap();
        read_until(stream, &format!("{user}@localhost/{resource}")).await;
    }

    // --- end-to-end negotiation tests ---

    #[tokio::test]
    async fn test_full_negotiation_over_tcp() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(stream_header()).await.unwrap();
        let features = read_until(&mut client, "</stream:features>").await;
        assert!(features.contains("<stream:stream"));
        assert!(features.contains("PLAIN"));

        client
            .write_all(plain_auth("james", "sekret").as_bytes())
            .await
            .unwrap();
        read_until(&mut client, "<success").await;

        // Fresh stream on the same socket; bind is now the advertised feature
        client.write_all(stream_header()).await.unwrap();
        let features = read_until(&mut client, "</stream:features>").await;
        assert!(features.contains("xmpp-bind"));
        assert!(!features.contains("PLAIN"));

        client
            .write_all(
                b"<iq type='set' id='bind_1'>\
                  <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                  <resource>tesla</resource></bind></iq>",
            )
            .await
            .unwrap();
        let reply = read_until(&mut client, "</iq>").await;
        assert!(reply.contains("james@localhost/tesla"));
        assert!(reply.contains("id='bind_1'"));

        assert!(supervisor.sessions().is_bound("james@localhost/tesla").await);
    }

    #[tokio::test]
    async fn test_failed_auth_then_retry_on_same_connection() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(stream_header()).await.unwrap();
        read_until(&mut client, "PLAIN").await;

        client
            .write_all(plain_auth("james", "wrong").as_bytes())
            .await
            .unwrap();
        read_until(&mut client, "<failure").await;

        // Same socket, same stream: a corrected attempt succeeds
        client
            .write_all(plain_auth("james", "sekret").as_bytes())
            .await
            .unwrap();
        read_until(&mut client, "<success").await;
    }

    #[tokio::test]
    async fn test_handshake_deadline_closes_silent_connection() {
        let config = EngineConfig {
            handshake_timeout: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let supervisor = test_supervisor(config);
        let addr = serve_on_loopback(supervisor).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Say nothing; the server must give up and close
        let mut collected = Vec::new();
        let n = timeout(Duration::from_secs(5), client.read_to_end(&mut collected))
            .await
            .expect("server never closed the silent connection")
            .unwrap();
        assert!(String::from_utf8_lossy(&collected[..n]).contains("</stream:stream>"));
    }

    #[tokio::test]
    async fn test_handshake_deadline_is_total_not_per_frame() {
        let config = EngineConfig {
            handshake_timeout: Duration::from_millis(400),
            ..EngineConfig::default()
        };
        let supervisor = test_supervisor(config);
        let addr = serve_on_loopback(supervisor).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(stream_header()).await.unwrap();
        read_until(&mut client, "PLAIN").await;

        // Keep the stream busy with legal traffic that never authenticates;
        // a per-frame window would reset forever, the total budget must not
        let (mut read_half, mut write_half) = client.into_split();
        let feeder = tokio::spawn(async move {
            loop {
                if write_half
                    .write_all(plain_auth("james", "wrong").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), read_half.read_to_end(&mut rest))
            .await
            .expect("deadline never fired despite per-frame activity")
            .unwrap();
        feeder.abort();
        assert!(String::from_utf8_lossy(&rest).contains("</stream:stream>"));
    }

    #[tokio::test]
    async fn test_idle_deadline_closes_established_session() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(300),
            ..EngineConfig::default()
        };
        let supervisor = test_supervisor(config);
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut client, "james", "sekret", "tesla").await;

        // Establish, then go silent
        client
            .write_all(
                b"<iq type='set' id='s1'>\
                  <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
            )
            .await
            .unwrap();
        read_until(&mut client, "id='s1'").await;

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("idle deadline never fired")
            .unwrap();
        assert!(String::from_utf8_lossy(&rest).contains("</stream:stream>"));

        for _ in 0..50 {
            if !supervisor.sessions().is_bound("james@localhost/tesla").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            !supervisor.sessions().is_bound("james@localhost/tesla").await,
            "idle-closed session stayed registered"
        );
    }

    #[tokio::test]
    async fn test_decode_failure_deregisters_bound_session() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut client, "james", "sekret", "tesla").await;

        // Extracts as a clean frame but fails stanza decoding, killing the
        // driver mid-session
        client
            .write_all(
                b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' \
                  mechanism='PLAIN'>!!not-base64!!</auth>",
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if !supervisor.sessions().is_bound("james@localhost/tesla").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            !supervisor.sessions().is_bound("james@localhost/tesla").await,
            "dead driver left its address registered"
        );
    }

    #[tokio::test]
    async fn test_violation_limit_closes_only_that_connection() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;

        let mut well_behaved = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut well_behaved, "james", "sekret", "tesla").await;

        let mut abuser = TcpStream::connect(addr).await.unwrap();
        abuser.write_all(stream_header()).await.unwrap();
        read_until(&mut abuser, "PLAIN").await;

        // Three out-of-order binds in a row: errors, then the stream closes
        let premature_bind = b"<iq type='set' id='early'>\
            <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>";
        for _ in 0..3 {
            abuser.write_all(premature_bind).await.unwrap();
        }
        let output = read_until(&mut abuser, "</stream:stream>").await;
        assert!(output.contains("unexpected-request"));
        let mut rest = Vec::new();
        abuser.read_to_end(&mut rest).await.unwrap();

        // The sibling session is untouched and still addressable
        assert!(
            supervisor.sessions().is_bound("james@localhost/tesla").await,
            "well-behaved session survived the abuser's close"
        );
    }

    // --- session table tests ---

    #[tokio::test]
    async fn test_send_to_delivers_to_bound_session() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut client, "james", "sekret", "tesla").await;

        supervisor
            .sessions()
            .send_to(
                "james@localhost/tesla",
                Stanza::QueryResult {
                    id: "push_1".to_string(),
                    payload: "<delivered/>".to_string(),
                },
            )
            .await
            .unwrap();
        let pushed = read_until(&mut client, "</iq>").await;
        assert!(pushed.contains("id='push_1'"));
        assert!(pushed.contains("<delivered/>"));
    }

    #[tokio::test]
    async fn test_send_to_unbound_address_fails() {
        let supervisor = test_supervisor(EngineConfig::default());
        let result = supervisor
            .sessions()
            .send_to(
                "nobody@localhost/x",
                Stanza::QueryResult {
                    id: "p".to_string(),
                    payload: String::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_duplicate_bind_newest_session_wins() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut first, "james", "sekret", "tesla").await;
        let mut second = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut second, "james", "sekret", "tesla").await;

        assert_eq!(supervisor.sessions().len().await, 1);

        // The displaced session's exit must not unregister its successor
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.sessions().is_bound("james@localhost/tesla").await);

        supervisor
            .sessions()
            .send_to(
                "james@localhost/tesla",
                Stanza::QueryResult {
                    id: "p1".to_string(),
                    payload: String::new(),
                },
            )
            .await
            .unwrap();
        read_until(&mut second, "id='p1'").await;
    }

    // --- lifecycle tests ---

    #[tokio::test]
    async fn test_guard_tracks_active_connections() {
        let supervisor = test_supervisor(EngineConfig::default());
        let (client, server) = tokio::io::duplex(4096);
        let handle = supervisor.attach(server);

        // The driver may not have started yet; wait for the count
        for _ in 0..50 {
            if supervisor.active_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.active_connections(), 1);

        drop(client);
        handle.await.unwrap();
        assert_eq!(supervisor.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_bound_sessions_and_deregisters() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut client, "james", "sekret", "tesla").await;

        supervisor.shutdown();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("server never closed on shutdown")
            .unwrap();
        assert!(String::from_utf8_lossy(&rest).contains("</stream:stream>"));

        for _ in 0..50 {
            if supervisor.sessions().len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.sessions().len().await, 0);
    }

    #[tokio::test]
    async fn test_peer_stream_close_ends_session_cleanly() {
        let supervisor = test_supervisor(EngineConfig::default());
        let addr = serve_on_loopback(supervisor.clone()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut client, "james", "sekret", "tesla").await;

        client.write_all(b"</stream:stream>").await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("server never answered the stream close")
            .unwrap();
        assert!(String::from_utf8_lossy(&rest).contains("</stream:stream>"));

        for _ in 0..50 {
            if !supervisor.sessions().is_bound("james@localhost/tesla").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!supervisor.sessions().is_bound("james@localhost/tesla").await);
    }
}
