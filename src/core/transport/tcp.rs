//! TCP transport implementation
//!
//! The socket is polled without blocking. `available` performs the actual
//! read and caches what it got for the following `receive`, so one poll
//! costs one syscall. A link that stays silent longer than the inactivity
//! window is torn down and reconnected in place. Socket errors and a peer
//! close do the same when `reconnect` is set, and otherwise leave the
//! transport disconnected.

use super::{
    secs_setting, Backoff, ConnectionState, DeviceTransport, TransportError, TransportEvent,
    TransportStats, TransportType, CONNECT_ATTEMPTS, DEFAULT_TCP_PORT,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bytes pulled from the socket per poll
const POLL_CHUNK: usize = 256;
/// Bytes drained by one `flush_input`
const FLUSH_CHUNK: usize = 1024;
/// How long `flush_input` waits for stale bytes
const FLUSH_TIMEOUT: Duration = Duration::from_millis(20);

/// TCP connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// Silence after which the link is rebuilt, in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: f64,
    /// Rebuild the link on socket errors
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_connect_timeout() -> f64 {
    3.0
}

fn default_inactivity_timeout() -> f64 {
    5.0
}

fn default_reconnect() -> bool {
    true
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout_secs: default_connect_timeout(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            reconnect: default_reconnect(),
        }
    }

    /// Set the inactivity window
    #[must_use]
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set the per-attempt connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Connect retry schedule: `min(0.5 + attempt, 5)` seconds
    pub fn backoff(&self) -> Backoff {
        Backoff::Linear {
            base: Duration::from_millis(500),
            step: Duration::from_secs(1),
            max: Duration::from_secs(5),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_TCP_PORT)
    }
}

/// Parses `HOST[:PORT]`.
impl FromStr for TcpConfig {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    TransportError::InvalidConfiguration(format!("invalid TCP port in {s:?}"))
                })?;
                (host.trim(), port)
            }
            None => (s.trim(), DEFAULT_TCP_PORT),
        };
        if host.is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "missing TCP host".to_string(),
            ));
        }
        Ok(Self::new(host, port))
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
    cache: BytesMut,
    last_read: Instant,
    inactivity: Duration,
    connect_timeout: Duration,
    stats: TransportStats,
    events: broadcast::Sender<TransportEvent>,
}

impl TcpTransport {
    /// Create a new, unconnected TCP transport
    pub fn new(config: TcpConfig) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            cache: BytesMut::new(),
            last_read: Instant::now(),
            inactivity: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            stats: TransportStats::default(),
            events,
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = self.config.address();
        let connect_timeout = self.connect_timeout;
        let backoff = self.config.backoff();
        let mut last_error = String::new();

        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                info!("connection retrying... {attempt}");
            }
            let result = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(ErrorKind::TimedOut, "connect timed out")),
            };
            match result {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    self.state = ConnectionState::Connected;
                    self.last_read = Instant::now();
                    self.cache.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", addr, e);
                    self.stats.errors += 1;
                    last_error = e.to_string();
                    let _ = self.events.send(TransportEvent::ConnectFailed {
                        attempt,
                        error: last_error.clone(),
                    });
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        Err(TransportError::ConnectionFailed {
            target: addr,
            attempts: CONNECT_ATTEMPTS,
            reason: last_error,
        })
    }

    /// Tear the link down and rebuild it.
    ///
    /// Only a failure to rebuild within the connect budget is returned.
    async fn reconnect(&mut self, reason: &str) -> Result<(), TransportError> {
        warn!("{}: reconnecting to {}", reason, self.config.address());
        self.state = ConnectionState::Reconnecting;
        let _ = self.events.send(TransportEvent::Reconnecting {
            reason: reason.to_string(),
        });
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("close before reconnect failed: {}", e);
            }
        }
        self.open().await?;
        self.stats.reconnects += 1;
        let _ = self.events.send(TransportEvent::Reconnected);
        info!("reconnected to {}", self.config.address());
        Ok(())
    }

    /// Drop a dead link when reconnecting is disabled
    fn abandon(&mut self, error: std::io::Error) -> TransportError {
        warn!("{}: giving up on {}", error, self.config.address());
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        let _ = self.events.send(TransportEvent::Closed);
        TransportError::IoError(error)
    }
}

#[async_trait]
impl DeviceTransport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.inactivity = secs_setting(
            "inactivity_timeout_secs",
            self.config.inactivity_timeout_secs,
        )?;
        self.connect_timeout =
            secs_setting("connect_timeout_secs", self.config.connect_timeout_secs)?;
        info!("connecting to {}", self.config.address());
        self.open().await?;
        let _ = self.events.send(TransportEvent::Connected);
        info!("connected to {}", self.config.address());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
            let _ = self.events.send(TransportEvent::Closed);
            info!("closed {}", self.config.address());
        }
        self.state = ConnectionState::Disconnected;
        self.cache.clear();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let result = match stream.write_all(data).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                self.stats.packets_sent += 1;
                debug!("SOCK:SEND: {}", hex::encode(data));
                Ok(data.len())
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!("send failed: {}", e);
                if self.config.reconnect {
                    self.reconnect("send error").await?;
                }
                Ok(0)
            }
        }
    }

    async fn available(&mut self) -> Result<usize, TransportError> {
        if !self.cache.is_empty() {
            return Ok(self.cache.len());
        }
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut chunk = [0u8; POLL_CHUNK];
        match stream.try_read(&mut chunk) {
            Ok(0) => {
                self.stats.errors += 1;
                if !self.config.reconnect {
                    return Err(self.abandon(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                self.reconnect("connection closed by peer").await?;
                Ok(0)
            }
            Ok(n) => {
                self.cache.extend_from_slice(&chunk[..n]);
                self.last_read = Instant::now();
                self.stats.bytes_received += n as u64;
                self.stats.packets_received += 1;
                Ok(n)
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if self.last_read.elapsed() > self.inactivity {
                    self.reconnect("receive timeout").await?;
                }
                Ok(0)
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!("receive failed: {}", e);
                if !self.config.reconnect {
                    return Err(self.abandon(e));
                }
                self.reconnect("receive error").await?;
                Ok(0)
            }
        }
    }

    async fn receive(&mut self, max: usize) -> Result<Bytes, TransportError> {
        let n = max.min(self.cache.len());
        let bytes = self.cache.split_to(n).freeze();
        if !bytes.is_empty() {
            debug!("SOCK:RECV: {}", hex::encode(&bytes));
        }
        Ok(bytes)
    }

    async fn flush_input(&mut self) -> Result<usize, TransportError> {
        let mut flushed = self.cache.len();
        self.cache.clear();
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut chunk = [0u8; FLUSH_CHUNK];
        match tokio::time::timeout(FLUSH_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => flushed += n,
            Ok(Err(e)) => debug!("flush read failed: {}", e),
            Err(_) => {}
        }
        Ok(flushed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn connection_info(&self) -> String {
        self.config.address()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_parse_host_and_port() {
        let config: TcpConfig = "dl24.local:9000".parse().unwrap();
        assert_eq!(config.host, "dl24.local");
        assert_eq!(config.port, 9000);

        let config: TcpConfig = "192.168.1.50".parse().unwrap();
        assert_eq!(config.port, DEFAULT_TCP_PORT);

        assert!(":8888".parse::<TcpConfig>().is_err());
        assert!("host:port".parse::<TcpConfig>().is_err());
    }

    #[tokio::test]
    async fn test_available_caches_for_receive() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0xCA, 0xCB, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", port));
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let mut available = 0;
        for _ in 0..100 {
            available = transport.available().await.unwrap();
            if available > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(available, 3);
        assert_eq!(transport.available().await.unwrap(), 3);
        assert_eq!(&transport.receive(2).await.unwrap()[..], &[0xCA, 0xCB]);
        assert_eq!(&transport.receive(16).await.unwrap()[..], &[0x00]);
        assert_eq!(transport.stats().bytes_received, 3);

        transport.close().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_silence_triggers_one_reconnect() {
        let (listener, port) = listener().await;
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                sockets.push(socket);
            }
        });

        let config =
            TcpConfig::new("127.0.0.1", port).inactivity_timeout(Duration::from_millis(100));
        let mut transport = TcpTransport::new(config);
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);

        assert_eq!(transport.available().await.unwrap(), 0);
        assert_eq!(transport.stats().reconnects, 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.available().await.unwrap(), 0);
        assert_eq!(transport.stats().reconnects, 1);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Reconnecting { .. }
        ));
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnected);

        // The fresh link restarts the inactivity window
        assert_eq!(transport.available().await.unwrap(), 0);
        assert_eq!(transport.stats().reconnects, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        transport.close().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_peer_close_triggers_reconnect() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (second, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(second);
        });

        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", port));
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);

        for _ in 0..200 {
            assert_eq!(transport.available().await.unwrap(), 0);
            if transport.stats().reconnects > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.stats().reconnects, 1);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Reconnecting { .. }
        ));
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnected);

        transport.close().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_peer_close_without_reconnect_disconnects() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = TcpConfig::new("127.0.0.1", port);
        config.reconnect = false;
        let mut transport = TcpTransport::new(config);
        transport.connect().await.unwrap();

        let mut outcome = Ok(0);
        for _ in 0..200 {
            outcome = transport.available().await;
            if outcome.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(outcome, Err(TransportError::IoError(_))));
        assert_eq!(transport.stats().reconnects, 0);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.available().await,
            Err(TransportError::NotConnected)
        ));

        server.abort();
    }

    #[tokio::test]
    async fn test_unrepresentable_timeouts_rejected_on_connect() {
        let (listener, port) = listener().await;

        let mut config = TcpConfig::new("127.0.0.1", port);
        config.inactivity_timeout_secs = 1e20;
        let mut transport = TcpTransport::new(config);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::InvalidConfiguration(_))
        ));

        let mut config = TcpConfig::new("127.0.0.1", port);
        config.connect_timeout_secs = f64::INFINITY;
        let mut transport = TcpTransport::new(config);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.stats().errors, 0);

        drop(listener);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        // Bind then drop to get a port nobody listens on
        let (listener, port) = listener().await;
        drop(listener);

        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", port));
        let mut events = transport.subscribe();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionFailed { attempts: CONNECT_ATTEMPTS, .. }
        ));
        for attempt in 0..CONNECT_ATTEMPTS {
            match events.recv().await.unwrap() {
                TransportEvent::ConnectFailed { attempt: seen, .. } => assert_eq!(seen, attempt),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
