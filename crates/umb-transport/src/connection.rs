use std::{
    io::{self, Read},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use umb_core::{
    codec::{self, FrameError},
    CommandOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Framed,
    Legacy,
}

impl Framing {
    pub fn from_greeting(greeting: &[u8]) -> Self {
        if codec::greeting_advertises_framing(greeting) {
            Framing::Framed
        } else {
            Framing::Legacy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready(Framing),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not connect to Unity at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake with Unity at {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: FrameError,
    },
    #[error("Unity at {addr} does not support FRAMING=1")]
    FramingRequired { addr: String },
    #[error("send to Unity failed: {0}")]
    Send(#[source] FrameError),
    #[error("receive from Unity failed: {0}")]
    Receive(#[source] FrameError),
    #[error("invalid JSON from Unity: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("unexpected reply from Unity: {0}")]
    UnexpectedReply(String),
}

impl ConnectionError {
    pub fn is_fast_transient(&self) -> bool {
        match self {
            ConnectionError::Connect { source, .. } => is_fast_kind(source.kind()),
            ConnectionError::Handshake { source, .. }
            | ConnectionError::Send(source)
            | ConnectionError::Receive(source) => match source {
                FrameError::Io(err) => is_fast_kind(err.kind()),
                FrameError::Truncated { .. } => true,
                FrameError::EmptyFrame | FrameError::OversizedFrame { .. } => false,
            },
            ConnectionError::FramingRequired { .. }
            | ConnectionError::InvalidResponse(_)
            | ConnectionError::UnexpectedReply(_) => false,
        }
    }

    pub fn outcome(&self) -> CommandOutcome {
        match self {
            ConnectionError::Connect { .. }
            | ConnectionError::Handshake { .. }
            | ConnectionError::FramingRequired { .. } => CommandOutcome::NotExecuted,
            ConnectionError::Send(_)
            | ConnectionError::Receive(_)
            | ConnectionError::InvalidResponse(_)
            | ConnectionError::UnexpectedReply(_) => CommandOutcome::Uncertain,
        }
    }
}

fn is_fast_kind(kind: io::ErrorKind) -> bool {
    codec::is_timeout_kind(kind)
        || matches!(
            kind,
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
}

/// One socket to one editor. A failed send or receive always drops the socket.
#[derive(Debug)]
pub struct FramedConnection {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl FramedConnection {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            io_timeout,
            stream: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        if port != self.port {
            info!(event = "unity_port_changed", old = self.port, new = port);
            self.disconnect();
            self.port = port;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Ready(_))
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() && self.stream.is_some() {
            return Ok(());
        }
        self.disconnect();
        let addr = self.addr();
        self.state = ConnectionState::Connecting;
        let result = self.open(&addr);
        if let Err(err) = &result {
            warn!(event = "unity_connect_failed", addr = %addr, error = %err);
            self.disconnect();
        }
        result
    }

    fn open(&mut self, addr: &str) -> Result<(), ConnectionError> {
        let connect_err = |source: io::Error| ConnectionError::Connect {
            addr: addr.to_string(),
            source,
        };
        let target = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| connect_err(io::Error::new(io::ErrorKind::NotFound, "no address")))?;
        let mut stream = TcpStream::connect_timeout(&target, self.connect_timeout).map_err(connect_err)?;
        let _ = stream.set_nodelay(true);

        self.state = ConnectionState::AwaitingHandshake;
        let handshake_err = |source: FrameError| ConnectionError::Handshake {
            addr: addr.to_string(),
            source,
        };
        stream
            .set_read_timeout(Some(self.connect_timeout))
            .map_err(|err| handshake_err(err.into()))?;
        let mut greeting = [0u8; codec::GREETING_WINDOW_BYTES];
        let n = stream
            .read(&mut greeting)
            .map_err(|err| handshake_err(err.into()))?;

        match Framing::from_greeting(&greeting[..n]) {
            Framing::Framed => {
                stream
                    .set_read_timeout(Some(self.io_timeout))
                    .map_err(|err| handshake_err(err.into()))?;
                stream
                    .set_write_timeout(Some(self.io_timeout))
                    .map_err(|err| handshake_err(err.into()))?;
                self.stream = Some(stream);
                self.state = ConnectionState::Ready(Framing::Framed);
                debug!(event = "unity_connected", addr = %addr);
                Ok(())
            }
            Framing::Legacy => {
                let _ = codec::write_frame(&mut stream, codec::FRAMING_REFUSAL);
                Err(ConnectionError::FramingRequired {
                    addr: addr.to_string(),
                })
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(event = "unity_disconnected", addr = %self.addr());
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.set_read_timeout(Some(timeout)),
            None => Ok(()),
        }
    }

    pub fn restore_receive_timeout(&mut self) -> io::Result<()> {
        let timeout = self.io_timeout;
        self.set_receive_timeout(timeout)
    }

    pub fn round_trip(&mut self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.connect()?;
        let result = self.exchange(payload);
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            ConnectionError::Send(FrameError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected",
            )))
        })?;
        codec::write_frame(stream, payload).map_err(ConnectionError::Send)?;
        codec::read_frame(stream, codec::MAX_FRAME_BYTES).map_err(ConnectionError::Receive)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        io::Write,
        net::TcpListener,
        sync::mpsc,
        thread,
    };

    pub(crate) fn connection(port: u16) -> FramedConnection {
        FramedConnection::new(
            "127.0.0.1",
            port,
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn legacy_greeting_is_refused_with_framed_notice() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.write_all(b"WELCOME UNITY-MCP\n").expect("greet");
            let notice = codec::read_frame(&mut stream, codec::MAX_FRAME_BYTES).expect("notice");
            tx.send(notice).expect("send");
        });

        let mut conn = connection(port);
        let err = conn.connect().expect_err("refused");
        assert!(matches!(err, ConnectionError::FramingRequired { .. }));
        assert_eq!(err.outcome(), CommandOutcome::NotExecuted);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let notice = rx.recv_timeout(Duration::from_secs(2)).expect("notice");
        assert_eq!(notice, codec::FRAMING_REFUSAL);
    }

    #[test]
    fn framed_round_trip_and_drop_on_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n").expect("greet");
            let request = codec::read_frame(&mut stream, codec::MAX_FRAME_BYTES).expect("request");
            codec::write_frame(&mut stream, &request).expect("echo");
            let _ = codec::read_frame(&mut stream, codec::MAX_FRAME_BYTES);
            stream.write_all(&0u64.to_be_bytes()).expect("zero header");
        });

        let mut conn = connection(port);
        conn.connect().expect("connect");
        assert_eq!(conn.state(), ConnectionState::Ready(Framing::Framed));
        let reply = conn.round_trip(br#"{"type":"x","params":{}}"#).expect("reply");
        assert_eq!(reply, br#"{"type":"x","params":{}}"#);

        let err = conn.round_trip(b"again").expect_err("zero frame");
        assert!(matches!(err, ConnectionError::Receive(FrameError::EmptyFrame)));
        assert!(!err.is_fast_transient());
        assert_eq!(err.outcome(), CommandOutcome::Uncertain);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn refused_connect_is_fast_transient() {
        let port = crate::probe::tests::closed_port();
        let err = connection(port).connect().expect_err("refused");
        assert!(err.is_fast_transient());
        assert!(err.outcome().is_retry_safe());
    }

    #[test]
    fn framing_detection() {
        assert_eq!(Framing::from_greeting(b"WELCOME FRAMING=1"), Framing::Framed);
        assert_eq!(Framing::from_greeting(b"WELCOME"), Framing::Legacy);
        assert_eq!(Framing::from_greeting(b""), Framing::Legacy);
    }
}
