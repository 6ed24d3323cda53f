//! Live development session.
//!
//! A session rides on one rendezvous connection. Once the remote agent says
//! hello it runs the main process hooked to the local terminal, mirrors
//! local file changes, serves remote consoles on a local port and tunnels a
//! local HTTP port to the dyno.
//!
//! The session ends when:
//!
//! - the main process channel closes (clean exit);
//! - the remote agent sends an `error` command;
//! - the connection drops or fails;
//! - the user interrupts.

pub mod bridge;
pub mod command;
pub mod console;
pub mod frame;
pub mod hookup;
pub mod metadata;
pub mod mux;
pub mod process;
pub mod rendezvous;
pub mod terminal;
pub mod tunnel;
pub mod watcher;

use crate::config::SessionConfig;
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::sync::SyncBackend;
use crate::{DynoError, Result};
use bridge::FileChangeBridge;
use command::ControlCommand;
use console::start_console_server;
use metadata::MetadataStore;
use mux::{Connection, Multiplexer};
use process::{stop_with_grace, ProcessApi, STOP_GRACE};
use rendezvous::{RelayHandle, RendezvousConnector};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use terminal::RawModeGuard;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tunnel::start_http_tunnel;
use watcher::DirectoryWatcher;
use tracing::{debug, info};

/// Everything a session needs besides its connection.
#[derive(Clone)]
pub struct SessionContext {
    pub root: PathBuf,
    pub metadata_dir: String,
    pub config: SessionConfig,
    pub backend: Arc<dyn SyncBackend>,
}

/// The remote process hosting a session, stopped when the session ends.
pub struct RemoteProcess {
    pub api: Arc<dyn ProcessApi>,
    pub app: String,
    pub process: String,
}

/// Dial `rendezvous_url` and run a session on the local terminal.
///
/// When the session ends the remote process, if any, is asked to stop; that
/// request gets a short grace period and is otherwise left behind.
pub async fn start(context: &SessionContext, rendezvous_url: &str, remote: Option<RemoteProcess>) -> Result<()> {
    let result = attach(context, rendezvous_url).await;

    if let Some(remote) = remote {
        stop_with_grace(remote.api, remote.app, remote.process, STOP_GRACE).await;
    }
    result
}

async fn attach(context: &SessionContext, rendezvous_url: &str) -> Result<()> {
    let (mux, driver) = Multiplexer::new();
    let fatal = watch_fatal(&mux);

    let connector = RendezvousConnector::new(&context.config);
    let (connection, relay) = connector
        .start(rendezvous_url, |stream| driver.start(stream))
        .await?;

    let shutdown = ShutdownCoordinator::new();
    let _raw = RawModeGuard::enable()?;
    drive(
        context,
        mux,
        connection,
        Some(relay),
        fatal,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown.wait_for_signal(),
    )
    .await
}

/// Run a session over `stream` until one of its end conditions.
pub async fn run<T, I, O, F>(
    context: &SessionContext,
    stream: T,
    relay: Option<RelayHandle>,
    input: I,
    output: O,
    interrupt: F,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (mux, driver) = Multiplexer::new();
    let fatal = watch_fatal(&mux);
    let connection = driver.start(stream);
    drive(context, mux, connection, relay, fatal, input, output, interrupt).await
}

/// Install the command handler; `error` commands come out of the receiver.
/// Registered before the reader starts so no command slips past it.
fn watch_fatal(mux: &Multiplexer) -> mpsc::UnboundedReceiver<String> {
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    mux.on_command(move |command| match command {
        ControlCommand::Error { message } => {
            let _ = fatal_tx.send(message);
        }
        ControlCommand::FileSynced { command, name } => {
            debug!("Remote {} {}", command, name.unwrap_or_default());
        }
        other => debug!("Ignoring inbound {:?}", other),
    });
    fatal_rx
}

#[allow(clippy::too_many_arguments)]
async fn drive<I, O, F>(
    context: &SessionContext,
    mux: Multiplexer,
    mut connection: Connection,
    relay: Option<RelayHandle>,
    mut fatal: mpsc::UnboundedReceiver<String>,
    input: I,
    output: O,
    interrupt: F,
) -> Result<()>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let relay_ended = async move {
        match relay {
            Some(relay) => relay
                .await
                .unwrap_or_else(|e| Err(DynoError::Connection(format!("relay task failed: {}", e)))),
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        result = serve(context, &mux, input, output) => result,
        result = connection.closed() => result.and_then(|()| connection_ended(&mux)),
        result = relay_ended => result.and_then(|()| connection_ended(&mux)),
        Some(message) = fatal.recv() => Err(DynoError::RemoteReported(message)),
        _ = interrupt => Err(DynoError::UserInterrupt),
    };

    match &outcome {
        Ok(()) => info!("Session finished"),
        Err(e) => info!("Session ended: {}", e),
    }
    connection.shutdown().await;
    outcome
}

fn connection_ended(mux: &Multiplexer) -> Result<()> {
    if mux.was_activated() {
        Ok(())
    } else {
        Err(DynoError::Connection(
            "connection closed before the remote process was ready".into(),
        ))
    }
}

/// Start every session service after hello; resolves when the main
/// process channel closes or the file-change bridge fails.
async fn serve<I, O>(context: &SessionContext, mux: &Multiplexer, input: I, output: O) -> Result<()>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    mux.wait_active().await?;

    let main = mux.run(&context.config.command).await?;
    info!("Running {}", context.config.command);
    let main_pump = tokio::spawn(hookup::hookup(main, input, output));

    let (watcher, events) = DirectoryWatcher::watch(&context.root)?;
    let bridge = FileChangeBridge::new(
        &context.root,
        &context.metadata_dir,
        context.config.watch_latency(),
        Arc::clone(&context.backend),
        mux.clone(),
    );
    let bridge_task = tokio::spawn(async move {
        let _watcher = watcher;
        bridge.run(events).await
    });

    let store = MetadataStore::new(&context.root, &context.metadata_dir);
    let (_, console_task) = start_console_server(mux.clone(), &context.config.console_command, &store).await?;
    let (_, tunnel_task) = start_http_tunnel(mux.clone(), context.config.local_port, context.config.remote_port).await?;

    let bridge_failed = async {
        match bridge_task.await {
            Ok(Ok(())) => std::future::pending().await,
            Ok(Err(e)) => Err(e),
            Err(e) => Err(DynoError::Connection(format!("file-change bridge failed: {}", e))),
        }
    };

    let result = tokio::select! {
        pumped = main_pump => {
            if let Ok(Err(e)) = pumped {
                debug!("Main process hookup ended: {}", e);
            }
            info!("Main process exited");
            Ok(())
        }
        result = bridge_failed => result,
    };

    console_task.abort();
    tunnel_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::frame::{Frame, OpenRequest};
    use super::mux::testing::{agent, FakeAgent};
    use super::*;
    use crate::session::command::CommandMessage;
    use crate::sync::testing::RecordingBackend;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::oneshot;

    fn context(dir: &TempDir) -> SessionContext {
        SessionContext {
            root: dir.path().to_path_buf(),
            metadata_dir: ".dyno".into(),
            config: SessionConfig {
                local_port: 0,
                watch_latency_ms: 20,
                ..SessionConfig::default()
            },
            backend: Arc::new(RecordingBackend::default()),
        }
    }

    struct Harness {
        agent: FakeAgent,
        stdin: DuplexStream,
        stdout: DuplexStream,
        interrupt: oneshot::Sender<()>,
        session: tokio::task::JoinHandle<Result<()>>,
    }

    fn launch(context: SessionContext) -> Harness {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (input, stdin) = tokio::io::duplex(1024);
        let (output, stdout) = tokio::io::duplex(1024);
        let (interrupt, interrupted) = oneshot::channel::<()>();

        let session = tokio::spawn(async move {
            run(&context, local, None, input, output, async {
                let _ = interrupted.await;
            })
            .await
        });

        Harness {
            agent: agent(remote),
            stdin,
            stdout,
            interrupt,
            session,
        }
    }

    async fn accept_main(agent: &mut FakeAgent) -> u32 {
        agent.hello().await;
        let (id, request) = agent.accept().await;
        assert_eq!(
            request,
            OpenRequest::Run {
                command: SessionConfig::default().command
            }
        );
        id
    }

    #[tokio::test]
    async fn test_main_channel_close_ends_session_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut h = launch(context(&dir));
        let main = accept_main(&mut h.agent).await;

        h.agent
            .send(Frame::data(main, Bytes::from_static(b"web.1: started\n")))
            .await;
        let mut line = [0u8; 15];
        h.stdout.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"web.1: started\n");

        h.agent.send(Frame::close(main)).await;
        h.session.await.unwrap().unwrap();
        drop(h.stdin);
    }

    #[tokio::test]
    async fn test_console_port_recorded_after_hello() {
        let dir = TempDir::new().unwrap();
        let mut h = launch(context(&dir));
        accept_main(&mut h.agent).await;

        let store = MetadataStore::new(dir.path(), ".dyno");
        let mut port = None;
        for _ in 0..50 {
            port = store.console_port().unwrap();
            if port.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(port.is_some());

        h.interrupt.send(()).unwrap();
        assert!(matches!(h.session.await.unwrap(), Err(DynoError::UserInterrupt)));
    }

    #[tokio::test]
    async fn test_error_command_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut h = launch(context(&dir));
        accept_main(&mut h.agent).await;

        h.agent
            .control(CommandMessage::new("error").with("message", "Slug too large"))
            .await;

        let err = h.session.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Slug too large");
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_is_clean() {
        let dir = TempDir::new().unwrap();
        let h = launch(context(&dir));

        h.interrupt.send(()).unwrap();
        let err = h.session.await.unwrap().unwrap_err();
        assert!(matches!(err, DynoError::UserInterrupt));
        assert_eq!(err.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_before_hello_is_connection_error() {
        let dir = TempDir::new().unwrap();
        let h = launch(context(&dir));

        drop(h.agent);
        let err = h.session.await.unwrap().unwrap_err();
        assert!(matches!(err, DynoError::Connection(_)));
    }

    #[tokio::test]
    async fn test_file_change_reaches_remote() {
        let dir = TempDir::new().unwrap();
        let mut h = launch(context(&dir));
        accept_main(&mut h.agent).await;

        // Give the watcher time to register
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("app.rb"), b"puts :hi").unwrap();

        let command = loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), h.agent.next())
                .await
                .unwrap();
            if frame.channel == frame::CONTROL_CHANNEL {
                break CommandMessage::from_slice(&frame.payload).unwrap();
            }
        };
        assert_eq!(command.command, "file.download");
        assert_eq!(command.data["name"], "app.rb");

        h.interrupt.send(()).unwrap();
        let _ = h.session.await;
    }

    #[tokio::test]
    async fn test_start_stops_remote_when_rendezvous_hangs_up() {
        use super::process::testing::RecordingProcessApi;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("rendezvous://{}/s3cret", listener.local_addr().unwrap());
        // Pairs, then goes away before the agent says hello
        let broker = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line, "s3cret\n");
            socket.write_all(b"rendezvous\n").await.unwrap();
        });

        let dir = TempDir::new().unwrap();
        let api = Arc::new(RecordingProcessApi::new(&url));
        let remote = RemoteProcess {
            api: api.clone(),
            app: "myapp".into(),
            process: "run.1".into(),
        };

        let err = tokio::time::timeout(Duration::from_secs(10), start(&context(&dir), &url, Some(remote)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DynoError::Connection(_)));
        assert_eq!(*api.stops.lock().unwrap(), vec!["run.1".to_string()]);
        broker.await.unwrap();
    }
}
