//! Framed I/O for one connection: a single reader feeding the router and a
//! single writer draining the outbound queue.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use futures_util::{SinkExt, StreamExt};
use tether_protocol::Codec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::registry::CorrelationRegistry;
use crate::router::DispatchRouter;
use crate::task::{CONNECTION_LOST, TaskTracker};

/// Where a backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint {0:?}: expected unix:/path, tcp://host:port or a socket path")]
pub struct InvalidEndpoint(pub String);

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.is_empty() || s.contains("://") {
            return Err(InvalidEndpoint(s.to_string()));
        }
        Ok(Endpoint::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Everything the reader needs to route frames and tear the session down.
pub(crate) struct ReadSide {
    pub codec: Codec,
    pub router: DispatchRouter,
    pub registry: CorrelationRegistry,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub finished: CancellationToken,
}

/// Spawn the reader and writer tasks for `io`.
pub(crate) fn spawn<T>(
    io: T,
    max_line_bytes: usize,
    outbound: mpsc::UnboundedReceiver<String>,
    side: ReadSide,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(io);
    let reader = FramedRead::new(r, LinesCodec::new_with_max_length(max_line_bytes));
    let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(max_line_bytes));

    tokio::spawn(write_loop(writer, outbound, side.shutdown.clone()));
    tokio::spawn(read_loop(reader, side));
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LinesCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = writer.send(frame).await {
            warn!(error = %err, "socket write failed");
            shutdown.cancel();
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut writer).await;
    debug!("writer stopped");
}

async fn read_loop<R>(mut reader: FramedRead<R, LinesCodec>, side: ReadSide)
where
    R: AsyncRead + Unpin,
{
    // FramedRead yields a single None after a decode error; it is not EOF.
    let mut recovering = false;

    loop {
        let next = tokio::select! {
            _ = side.shutdown.cancelled() => {
                debug!("session closed locally");
                break;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                recovering = false;
                if line.trim().is_empty() {
                    continue;
                }
                match side.codec.decode(&line) {
                    Ok(envelope) => {
                        side.router.route(envelope);
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable frame");
                    }
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("dropping over-long frame");
                recovering = true;
            }
            Some(Err(LinesCodecError::Io(err))) => {
                warn!(error = %err, "socket read failed");
                break;
            }
            None if recovering => {
                recovering = false;
            }
            None => {
                info!("backend closed the connection");
                break;
            }
        }
    }

    side.shutdown.cancel();
    let rejected = side.registry.close(SessionError::TransportClosed);
    let failed = side.tracker.fail_all(CONNECTION_LOST);
    info!(rejected, failed, "session ended");
    side.finished.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_forms() {
        assert_eq!(
            "unix:/run/tether.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/tether.sock"))
        );
        assert_eq!(
            "/tmp/t.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/t.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:7410".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7410".to_string())
        );
    }

    #[test]
    fn rejects_bad_endpoints() {
        for bad in ["", "unix:", "tcp://nohost", "tcp://:80", "tcp://h:notaport", "ws://x"] {
            assert!(bad.parse::<Endpoint>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn display_round_trips() {
        for s in ["unix:/run/tether.sock", "tcp://localhost:7410"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }
}
