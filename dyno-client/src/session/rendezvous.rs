//! Rendezvous connector.
//!
//! Dials the URL handed out by a process start and exposes the connection
//! as a plain in-process byte pipe. Two flavours are understood:
//!
//! - `rendezvous://host:port/secret`: raw TCP; the secret is written as the
//!   first line and the broker answers with a `rendezvous` line.
//! - `ws://` / `wss://`: a WebSocket whose binary messages carry the stream.
//!
//! The connector never looks inside the bytes it relays.

use crate::config::SessionConfig;
use crate::{DynoError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Size of the in-process pipe and of each relay read
const PIPE_BUFFER: usize = 64 * 1024;

/// Acknowledgement line a rendezvous broker sends once both ends are paired
const RENDEZVOUS_ACK: &str = "rendezvous";

/// Background task relaying bytes between the network and the local pipe.
/// Resolves with the reason the connection ended.
pub type RelayHandle = JoinHandle<Result<()>>;

#[derive(Debug, Clone)]
pub struct RendezvousConnector {
    connect_timeout: Duration,
    activity_timeout: Option<Duration>,
}

impl RendezvousConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            activity_timeout: config.activity_timeout(),
        }
    }

    pub fn with_timeouts(connect_timeout: Duration, activity_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            activity_timeout,
        }
    }

    /// Connect to `url` and hand the resulting byte stream to `on_connect`.
    pub async fn start<F, R>(&self, url: &str, on_connect: F) -> Result<(R, RelayHandle)>
    where
        F: FnOnce(DuplexStream) -> R,
    {
        let (stream, relay) = self.connect(url).await?;
        Ok((on_connect(stream), relay))
    }

    /// Connect to `url`; returns the local end of the pipe and its relay task.
    pub async fn connect(&self, url: &str) -> Result<(DuplexStream, RelayHandle)> {
        let parsed = Url::parse(url)
            .map_err(|e| DynoError::Connection(format!("invalid rendezvous url {}: {}", url, e)))?;

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        let activity = self.activity_timeout;

        let relay = match parsed.scheme() {
            "rendezvous" => {
                let stream = self.within_timeout(connect_tcp(&parsed)).await?;
                info!("Rendezvous established with {}", host_port(&parsed)?);
                tokio::spawn(relay_stream(stream, remote, activity))
            }
            "ws" | "wss" => {
                let (socket, _) = self
                    .within_timeout(async {
                        tokio_tungstenite::connect_async(url)
                            .await
                            .map_err(websocket_error)
                    })
                    .await?;
                info!("Rendezvous websocket established with {}", parsed.host_str().unwrap_or(url));
                tokio::spawn(relay_websocket(socket, remote, activity))
            }
            other => {
                return Err(DynoError::Connection(format!(
                    "unsupported rendezvous scheme: {}",
                    other
                )))
            }
        };

        Ok((local, relay))
    }

    async fn within_timeout<T>(&self, connect: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                DynoError::Connection(format!(
                    "timed out after {}s waiting for rendezvous",
                    self.connect_timeout.as_secs()
                ))
            })?
    }
}

fn host_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| DynoError::Connection(format!("rendezvous url without host: {}", url)))?;
    let port = url
        .port()
        .ok_or_else(|| DynoError::Connection(format!("rendezvous url without port: {}", url)))?;
    Ok(format!("{}:{}", host, port))
}

async fn connect_tcp(url: &Url) -> Result<BufReader<TcpStream>> {
    let address = host_port(url)?;
    let secret = url.path().trim_start_matches('/');

    debug!("Dialing rendezvous {}", address);
    let stream = TcpStream::connect(&address).await.map_err(connection_error)?;
    stream.set_nodelay(true).map_err(connection_error)?;

    let mut stream = BufReader::new(stream);
    stream
        .write_all(format!("{}\n", secret).as_bytes())
        .await
        .map_err(connection_error)?;
    stream.flush().await.map_err(connection_error)?;

    let mut line = String::new();
    let read = stream.read_line(&mut line).await.map_err(connection_error)?;
    if read == 0 {
        return Err(DynoError::Connection(
            "rendezvous closed before pairing".to_string(),
        ));
    }
    if line.trim() != RENDEZVOUS_ACK {
        return Err(DynoError::Connection(format!(
            "unexpected rendezvous reply: {}",
            line.trim()
        )));
    }

    Ok(stream)
}

fn connection_error(e: std::io::Error) -> DynoError {
    match e.kind() {
        ErrorKind::ConnectionRefused => DynoError::Connection("connection refused".to_string()),
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            DynoError::Connection("connection reset".to_string())
        }
        _ => DynoError::Connection(e.to_string()),
    }
}

fn websocket_error(e: tokio_tungstenite::tungstenite::Error) -> DynoError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match e {
        WsError::Io(e) => connection_error(e),
        WsError::Tls(e) => DynoError::Connection(format!("transport security failure: {}", e)),
        other => DynoError::Connection(other.to_string()),
    }
}

/// Run one relay step, bounded by the activity timeout when one is set.
async fn step<T>(activity: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match activity {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            DynoError::Connection(format!("no activity for {}s", limit.as_secs()))
        })?,
        None => fut.await,
    }
}

struct StreamRelay<S> {
    net_read: ReadHalf<S>,
    net_write: WriteHalf<S>,
    local_read: ReadHalf<DuplexStream>,
    local_write: WriteHalf<DuplexStream>,
    from_net: Vec<u8>,
    from_local: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite> StreamRelay<S> {
    /// Move one chunk in whichever direction is ready. `false` at end of stream.
    async fn once(&mut self) -> Result<bool> {
        tokio::select! {
            read = self.net_read.read(&mut self.from_net) => {
                let n = read.map_err(connection_error)?;
                if n == 0 {
                    debug!("Rendezvous peer closed the connection");
                    return Ok(false);
                }
                // The session side may already be gone
                Ok(self.local_write.write_all(&self.from_net[..n]).await.is_ok())
            }
            read = self.local_read.read(&mut self.from_local) => {
                let n = read?;
                if n == 0 {
                    debug!("Session closed its end of the rendezvous");
                    return Ok(false);
                }
                self.net_write
                    .write_all(&self.from_local[..n])
                    .await
                    .map_err(connection_error)?;
                self.net_write.flush().await.map_err(connection_error)?;
                Ok(true)
            }
        }
    }
}

async fn relay_stream<S>(network: S, local: DuplexStream, activity: Option<Duration>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (net_read, net_write) = tokio::io::split(network);
    let (local_read, local_write) = tokio::io::split(local);
    let mut relay = StreamRelay {
        net_read,
        net_write,
        local_read,
        local_write,
        from_net: vec![0u8; PIPE_BUFFER],
        from_local: vec![0u8; PIPE_BUFFER],
    };

    let result = loop {
        match step(activity, relay.once()).await {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let _ = relay.net_write.shutdown().await;
    let _ = relay.local_write.shutdown().await;
    if let Err(e) = &result {
        warn!("Rendezvous relay stopped: {}", e);
    }
    result
}

struct WebSocketRelay<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    messages: SplitStream<WebSocketStream<S>>,
    local_read: ReadHalf<DuplexStream>,
    local_write: WriteHalf<DuplexStream>,
    from_local: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WebSocketRelay<S> {
    async fn once(&mut self) -> Result<bool> {
        tokio::select! {
            message = self.messages.next() => match message {
                Some(Ok(Message::Binary(data))) => Ok(self.local_write.write_all(&data).await.is_ok()),
                Some(Ok(Message::Text(text))) => {
                    Ok(self.local_write.write_all(text.as_bytes()).await.is_ok())
                }
                Some(Ok(Message::Ping(data))) => {
                    self.sink.send(Message::Pong(data)).await.map_err(websocket_error)?;
                    Ok(true)
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Rendezvous websocket closed by peer");
                    Ok(false)
                }
                Some(Ok(_)) => Ok(true),
                Some(Err(e)) => Err(websocket_error(e)),
            },
            read = self.local_read.read(&mut self.from_local) => {
                let n = read?;
                if n == 0 {
                    let _ = self.sink.send(Message::Close(None)).await;
                    return Ok(false);
                }
                self.sink
                    .send(Message::Binary(self.from_local[..n].to_vec()))
                    .await
                    .map_err(websocket_error)?;
                Ok(true)
            }
        }
    }
}

async fn relay_websocket<S>(socket: WebSocketStream<S>, local: DuplexStream, activity: Option<Duration>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, messages) = socket.split();
    let (local_read, local_write) = tokio::io::split(local);
    let mut relay = WebSocketRelay {
        sink,
        messages,
        local_read,
        local_write,
        from_local: vec![0u8; PIPE_BUFFER],
    };

    let result = loop {
        match step(activity, relay.once()).await {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let _ = relay.local_write.shutdown().await;
    if let Err(e) = &result {
        warn!("Rendezvous websocket relay stopped: {}", e);
    }
    result
}
