use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use tracing::debug;
use umb_core::{
    codec::{self, FrameError},
    BridgeConfig,
};

#[derive(Debug, Clone)]
pub struct LivenessProbe {
    host: String,
    timeout: Duration,
}

impl LivenessProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.host.clone(), config.probe_timeout)
    }

    pub fn is_alive(&self, port: u16) -> bool {
        match self.exchange(port) {
            Ok(alive) => alive,
            Err(err) => {
                debug!(event = "probe_failed", port, error = %err);
                false
            }
        }
    }

    fn exchange(&self, port: u16) -> Result<bool, FrameError> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut greeting = [0u8; codec::GREETING_WINDOW_BYTES];
        let n = stream.read(&mut greeting)?;
        let reply = if codec::greeting_advertises_framing(&greeting[..n]) {
            codec::write_frame(&mut stream, codec::PING_LITERAL)?;
            codec::read_frame(&mut stream, codec::MAX_PROBE_FRAME_BYTES)?
        } else {
            stream.write_all(codec::PING_LITERAL)?;
            stream.flush()?;
            codec::read_legacy_message(&mut stream, codec::LEGACY_PROBE_WINDOW_BYTES)?
        };
        Ok(codec::contains_pong(&reply))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{net::TcpListener, thread};

    pub(crate) const PONG: &[u8] = br#"{"status":"success","result":{"message":"pong"}}"#;

    pub(crate) fn spawn_pong_host(framed: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                thread::spawn(move || {
                    if framed {
                        let _ = stream.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n");
                        if codec::read_frame(&mut stream, codec::MAX_FRAME_BYTES).is_ok() {
                            let _ = codec::write_frame(&mut stream, PONG);
                        }
                    } else {
                        let _ = stream.write_all(b"WELCOME UNITY-MCP\n");
                        let mut buf = [0u8; 16];
                        if stream.read(&mut buf).is_ok() {
                            let _ = stream.write_all(PONG);
                        }
                    }
                });
            }
        });
        port
    }

    pub(crate) fn spawn_silent_host() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                let _ = stream.write_all(b"WELCOME UNITY-MCP 1 FRAMING=1\n");
                held.push(stream);
            }
        });
        port
    }

    pub(crate) fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn probe() -> LivenessProbe {
        LivenessProbe::new("127.0.0.1", Duration::from_millis(300))
    }

    #[test]
    fn framed_host_answers_pong() {
        assert!(probe().is_alive(spawn_pong_host(true)));
    }

    #[test]
    fn legacy_host_answers_pong() {
        assert!(probe().is_alive(spawn_pong_host(false)));
    }

    #[test]
    fn silent_or_closed_ports_are_not_alive() {
        assert!(!probe().is_alive(spawn_silent_host()));
        assert!(!probe().is_alive(closed_port()));
    }

    #[test]
    fn oversized_probe_reply_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = stream.write_all(b"FRAMING=1");
                let _ = codec::read_frame(&mut stream, codec::MAX_FRAME_BYTES);
                let header = (codec::MAX_PROBE_FRAME_BYTES + 1).to_be_bytes();
                let _ = stream.write_all(&header);
                let _ = stream.write_all(br#""message":"pong""#);
            }
        });
        assert!(!probe().is_alive(port));
    }
}
