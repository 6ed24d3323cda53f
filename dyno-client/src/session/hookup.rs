//! IO hookup: a bidirectional pump between one channel and a local endpoint.

use super::mux::{Channel, ChannelKind, ChannelReader, ChannelWriter, Multiplexer};
use crate::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HOOKUP_BUFFER: usize = 16 * 1024;

/// Pump `input` into the channel and the channel into `output`.
///
/// Returns when either side reaches end of stream or the channel closes.
/// The channel is closed on the way out, which fires its close callback.
pub async fn hookup<I, O>(channel: Channel, input: I, output: O) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let id = channel.id();
    let (reader, writer) = channel.split();

    let result = pump(reader, &writer, input, output).await;
    if let Err(e) = &result {
        debug!("Hookup on channel {} failed: {}", id, e);
    }

    writer.close().await;
    result
}

/// Hook a channel up to a socket-like stream.
pub async fn hookup_stream<S>(channel: Channel, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (input, output) = tokio::io::split(stream);
    hookup(channel, input, output).await
}

/// Run [`hookup_stream`] on its own task.
pub fn spawn_hookup<S>(channel: Channel, stream: S) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = channel.id();
    tokio::spawn(async move {
        match hookup_stream(channel, stream).await {
            Ok(()) => debug!("Hookup on channel {} finished", id),
            Err(e) => warn!("Hookup on channel {} ended with error: {}", id, e),
        }
    })
}

/// Accept connections on `listener` until the session closes, hooking each
/// one up to a freshly opened channel of `kind`.
///
/// The socket is dropped, and so closed, once its channel closes.
pub async fn serve_listener(listener: TcpListener, mux: Multiplexer, kind: ChannelKind) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = mux.closed() => break,
        };
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        debug!("Accepted {} for {:?}", peer, kind);

        let mux = mux.clone();
        let kind = kind.clone();
        tokio::spawn(async move {
            match mux.open(kind).await {
                Ok(channel) => {
                    if let Err(e) = hookup_stream(channel, socket).await {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                }
                Err(e) => warn!("Could not open channel for {}: {}", peer, e),
            }
        });
    }

    info!("Stopped accepting on {}", listener.local_addr()?);
    Ok(())
}

async fn pump<I, O>(mut reader: ChannelReader, writer: &ChannelWriter, mut input: I, mut output: O) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; HOOKUP_BUFFER];

    loop {
        tokio::select! {
            chunk = reader.recv() => match chunk {
                Some(bytes) => {
                    output.write_all(&bytes).await?;
                    output.flush().await?;
                }
                None => {
                    debug!("Channel {} closed, stopping hookup", reader.id());
                    break;
                }
            },
            read = input.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Local end of channel {} reached end of stream", writer.id());
                    break;
                }
                writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
            }
        }
    }

    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::frame::{Frame, FrameFlags};
    use crate::session::mux::testing::pair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run_kind() -> ChannelKind {
        ChannelKind::Run {
            command: "bash".into(),
        }
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (connection, mut agent) = pair();
        let mux = connection.mux().clone();
        agent.hello().await;
        let channel = agent.open(&mux, run_kind()).await;
        let id = channel.id();

        let (local, mut user) = tokio::io::duplex(1024);
        let pump = spawn_hookup(channel, local);

        user.write_all(b"ls\n").await.unwrap();
        assert_eq!(agent.next().await, Frame::data(id, Bytes::from_static(b"ls\n")));

        agent.send(Frame::data(id, Bytes::from_static(b"Gemfile\n"))).await;
        let mut buf = [0u8; 8];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Gemfile\n");

        drop(user);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_eof_closes_channel() {
        let (connection, mut agent) = pair();
        let mux = connection.mux().clone();
        agent.hello().await;
        let channel = agent.open(&mux, run_kind()).await;
        let id = channel.id();

        let fired = Arc::new(AtomicUsize::new(0));
        channel.on_close({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (local, user) = tokio::io::duplex(1024);
        drop(user);
        hookup_stream(channel, local).await.unwrap();

        let close = agent.next().await;
        assert_eq!(close.channel, id);
        assert!(close.flags.contains(FrameFlags::CLOSE));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_ends_pump_once() {
        let (connection, mut agent) = pair();
        let mux = connection.mux().clone();
        agent.hello().await;
        let channel = agent.open(&mux, run_kind()).await;
        let id = channel.id();

        let fired = Arc::new(AtomicUsize::new(0));
        channel.on_close({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (local, _user) = tokio::io::duplex(1024);
        let pump = tokio::spawn(hookup_stream(channel, local));

        agent.send(Frame::close(id)).await;
        pump.await.unwrap().unwrap();

        mux.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hookups_are_isolated() {
        let (connection, mut agent) = pair();
        let mux = connection.mux().clone();
        agent.hello().await;

        let first = agent.open(&mux, run_kind()).await;
        let second = agent.open(&mux, ChannelKind::Tunnel { port: 5000 }).await;
        let (first_id, second_id) = (first.id(), second.id());

        let (local_a, mut user_a) = tokio::io::duplex(1024);
        let (local_b, mut user_b) = tokio::io::duplex(1024);
        spawn_hookup(first, local_a);
        spawn_hookup(second, local_b);

        agent.send(Frame::data(second_id, Bytes::from_static(b"bbb"))).await;
        agent.send(Frame::data(first_id, Bytes::from_static(b"aaa"))).await;

        let mut buf = [0u8; 3];
        user_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aaa");
        user_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bbb");
    }

    #[tokio::test]
    async fn test_listener_opens_channel_per_connection() {
        let (connection, mut agent) = pair();
        let mux = connection.mux().clone();
        agent.hello().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_listener(
            listener,
            mux.clone(),
            ChannelKind::Tunnel { port: 5000 },
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (id, request) = agent.accept().await;
        assert_eq!(request, crate::session::frame::OpenRequest::Tunnel { port: 5000 });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let frame = agent.next().await;
        assert_eq!(frame.channel, id);
        assert!(frame.payload.starts_with(b"GET /"));

        // Remote close drops the socket
        agent.send(Frame::close(id)).await;
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        mux.shutdown();
        server.await.unwrap().unwrap();
    }
}
