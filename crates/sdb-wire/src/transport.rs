use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{PacketCodec, HANDSHAKE};
use crate::{Result, WireError};

/// Lazy, restartable sequence of decoded packets.
pub type PacketStream = FramedRead<OwnedReadHalf, PacketCodec>;
pub type PacketSink = FramedWrite<OwnedWriteHalf, PacketCodec>;

/// A TCP connection to a debug agent, before it is split into framed halves.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Self::from_stream(stream),
            Ok(Err(source)) => Err(WireError::ConnectFailed { addr, source }),
            Err(_) => Err(WireError::ConnectTimeout { addr, attempts: 1 }),
        }
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        // Commands are small and latency-bound.
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Exchange the `DWP-Handshake` banner.
    ///
    /// Both sides send the banner and then expect it back, so this works the
    /// same whichever side opened the connection.
    pub async fn handshake(&mut self, timeout: Duration) -> Result<()> {
        let exchange = async {
            self.stream.write_all(HANDSHAKE).await?;
            let mut banner = [0u8; HANDSHAKE.len()];
            self.stream.read_exact(&mut banner).await?;
            Ok::<_, std::io::Error>(banner)
        };

        let banner = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(banner)) => banner,
            Ok(Err(err)) => {
                return Err(WireError::HandshakeFailed(format!(
                    "connection to {} failed during handshake: {err}",
                    self.peer
                )))
            }
            Err(_) => {
                return Err(WireError::HandshakeFailed(format!(
                    "no handshake from {} within {timeout:?}",
                    self.peer
                )))
            }
        };

        if banner != *HANDSHAKE {
            return Err(WireError::HandshakeFailed(format!(
                "unexpected banner {:?}",
                String::from_utf8_lossy(&banner)
            )));
        }
        tracing::debug!(target: "sdb.wire", peer = %self.peer, "handshake complete");
        Ok(())
    }

    pub fn into_framed(self, max_packet_bytes: usize) -> (PacketStream, PacketSink) {
        let (read, write) = self.stream.into_split();
        (
            FramedRead::new(read, PacketCodec::new(max_packet_bytes)),
            FramedWrite::new(write, PacketCodec::new(max_packet_bytes)),
        )
    }
}

/// Listening socket for launch mode, where the target connects back to us.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| WireError::ConnectFailed { addr, source })?;
        let local = inner.local_addr()?;
        tracing::debug!(target: "sdb.wire", %local, "listening for debug agent");
        Ok(Self { inner, local })
    }

    /// The bound address; with port `0` this carries the ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn accept(&self, timeout: Duration) -> Result<Connection> {
        match tokio::time::timeout(timeout, self.inner.accept()).await {
            Ok(Ok((stream, peer))) => {
                tracing::debug!(target: "sdb.wire", %peer, "debug agent connected");
                Connection::from_stream(stream)
            }
            Ok(Err(source)) => Err(WireError::ConnectFailed {
                addr: self.local,
                source,
            }),
            Err(_) => Err(WireError::ConnectTimeout {
                addr: self.local,
                attempts: 1,
            }),
        }
    }
}

/// Bounded exponential backoff for attach-mode connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Poll-connect to an agent that listens, retrying until `backoff` runs out of
/// attempts or `deadline` elapses.
pub async fn connect_with_backoff(
    addr: SocketAddr,
    backoff: &Backoff,
    deadline: Duration,
) -> Result<Connection> {
    let deadline = Instant::now() + deadline;
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WireError::ConnectTimeout { addr, attempts });
        }

        attempts += 1;
        match Connection::connect(addr, remaining).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                tracing::debug!(
                    target: "sdb.wire",
                    %addr,
                    attempt = attempts,
                    error = %err,
                    "connect attempt failed"
                );
            }
        }

        if attempts >= max_attempts {
            return Err(WireError::ConnectTimeout { addr, attempts });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff.delay(attempts).min(remaining)).await;
    }
}
