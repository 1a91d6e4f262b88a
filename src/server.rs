//! TCP ingestion server for the sensor device.
//!
//! Accepts device connections, turns each byte stream into decoded readings
//! pushed onto the ingestion queue, and tracks the single current connection
//! eligible to receive operator commands.
//!
//! The design is single-current-client, not multiplexed: a newly accepted
//! connection supersedes the previous one, which is shut down explicitly.

use crate::ingest::{QueueClosed, ReadingSender};
use crate::protocol::{self, Command};
use bytes::BytesMut;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size per connection
const BUFFER_SIZE: usize = 4 * 1024;

/// Listen backlog
const BACKLOG: i32 = 128;

/// Errors that abort server startup.
#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be bound.
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind '{}': {}", addr, source)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
        }
    }
}

/// The current device link eligible to receive commands.
struct DeviceLink {
    id: u64,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    /// Wakes the link's read loop when the link is superseded or the server
    /// stops.
    closed: Arc<Notify>,
}

/// State shared between the accept loop, connection handlers, and command
/// senders. The current-connection slot is the only cross-cutting mutable
/// resource; every access goes through its lock.
struct Shared {
    current: Mutex<Option<DeviceLink>>,
    sender: ReadingSender,
    link_ids: AtomicU64,
}

/// Server instance owning the listener and the current device connection.
pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the listen address and start accepting connections.
    ///
    /// Decoded readings are pushed onto `sender`. Bind failure is fatal;
    /// everything after startup is recovered locally.
    pub async fn start(listen: &str, sender: ReadingSender) -> Result<Server, ServerError> {
        let addr: SocketAddr = listen.parse().map_err(|e| ServerError::Bind {
            addr: listen.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let listener = bind_listener(addr).map_err(|e| ServerError::Bind {
            addr: listen.to_string(),
            source: e,
        })?;

        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: listen.to_string(),
            source: e,
        })?;

        info!(address = %local_addr, "Server listening");

        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            sender,
            link_ids: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, accept_shared, shutdown_rx).await;
        });

        Ok(Server {
            local_addr,
            shared,
            shutdown: shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a device connection is currently installed.
    pub async fn has_device(&self) -> bool {
        self.shared.current.lock().await.is_some()
    }

    /// Send a command to the currently connected device.
    ///
    /// With no device connected this is a logged no-op; write failures are
    /// logged and never propagated to the caller.
    pub async fn send_command(&self, command: &Command) {
        let mut current = self.shared.current.lock().await;
        match current.as_mut() {
            Some(link) => {
                let line = command.to_line();
                match link.writer.write_all(line.as_bytes()).await {
                    Ok(()) => debug!(peer = %link.peer, command = %command, "Command sent"),
                    Err(e) => {
                        warn!(peer = %link.peer, command = %command, error = %e,
                              "Failed to send command")
                    }
                }
            }
            None => warn!(command = %command, "No device connected, command dropped"),
        }
    }

    /// Stop the server. Idempotent and safe to call from any task.
    ///
    /// Unblocks the accept loop, shuts the current device link down, and
    /// waits for the listener to be released, so the port is re-bindable the
    /// moment this returns. Errors while closing are logged, not propagated.
    pub async fn stop(&self) {
        let accept_task = self.accept_task.lock().await.take();

        let _ = self.shutdown.send(true);

        if let Some(link) = self.shared.current.lock().await.take() {
            close_link(link).await;
        }

        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                debug!(error = %e, "Accept task ended abnormally");
            }
            info!(address = %self.local_addr, "Server stopped");
        }
    }
}

/// Build the listener with address reuse enabled.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accept connections until shutdown is requested or accepting fails.
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            // Requested shutdown; expected, not a failure.
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Connection accepted");
                install_connection(&shared, stream, peer).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                break;
            }
        }
    }

    trace!("Accept loop exited");
}

/// Install a connection as the current device link and spawn its handler.
///
/// Any previous link is superseded: shut down and its handler woken.
async fn install_connection(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let id = shared.link_ids.fetch_add(1, Ordering::SeqCst);
    let (reader, writer) = stream.into_split();
    let closed = Arc::new(Notify::new());

    let link = DeviceLink {
        id,
        peer,
        writer,
        closed: Arc::clone(&closed),
    };

    {
        let mut current = shared.current.lock().await;
        if let Some(old) = current.replace(link) {
            warn!(old_peer = %old.peer, new_peer = %peer, "Superseding previous device connection");
            close_link(old).await;
        }
    }

    let handler_shared = Arc::clone(shared);
    tokio::spawn(async move {
        handle_connection(reader, id, peer, closed, handler_shared).await;
    });
}

/// Shut a device link down, waking its read loop.
async fn close_link(mut link: DeviceLink) {
    link.closed.notify_one();
    if let Err(e) = link.writer.shutdown().await {
        debug!(peer = %link.peer, error = %e, "Error shutting down device socket");
    }
}

/// Per-connection read loop: buffer bytes, split on newlines, decode, and
/// enqueue. A line that fails to decode is logged and dropped; only
/// socket-level errors terminate the connection.
async fn handle_connection(
    mut reader: OwnedReadHalf,
    id: u64,
    peer: SocketAddr,
    closed: Arc<Notify>,
    shared: Arc<Shared>,
) {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let read = tokio::select! {
            _ = closed.notified() => {
                trace!(peer = %peer, "Connection handler woken for close");
                break;
            }
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                trace!(peer = %peer, "Connection closed by device");
                break;
            }
            Ok(_) => {
                if drain_lines(&mut buffer, &shared.sender).await.is_err() {
                    debug!(peer = %peer, "Ingestion queue closed, dropping connection");
                    break;
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Socket read failed");
                break;
            }
        }
    }

    // Clear the current-connection slot only if it still refers to this
    // link; a newer connection may have taken it already.
    let mut current = shared.current.lock().await;
    if current.as_ref().map(|link| link.id) == Some(id) {
        *current = None;
        debug!(peer = %peer, "Device disconnected");
    }
}

/// Extract and decode every complete line in the buffer, enqueueing each
/// successfully decoded reading in arrival order.
async fn drain_lines(buffer: &mut BytesMut, sender: &ReadingSender) -> Result<(), QueueClosed> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw = buffer.split_to(pos + 1);
        let line = String::from_utf8_lossy(&raw);

        match protocol::decode(&line) {
            Ok(Some(reading)) => {
                trace!(mode = reading.measurement.mode(), "Reading decoded");
                sender.send(reading).await?;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropped undecodable line"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{self, ReadingReceiver};
    use crate::protocol::{Measurement, Reading};
    use tokio::time::{sleep, timeout, Duration};

    async fn start_test_server() -> (Server, ReadingReceiver) {
        let (tx, rx) = ingest::queue(64);
        let server = Server::start("127.0.0.1:0", tx).await.unwrap();
        (server, rx)
    }

    async fn wait_for_readings(rx: &mut ReadingReceiver, n: usize) -> Vec<Reading> {
        let mut batch = Vec::new();
        for _ in 0..200 {
            batch.extend(rx.drain());
            if batch.len() >= n {
                return batch;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} readings, got {}", n, batch.len());
    }

    async fn wait_for_device(server: &Server) {
        for _ in 0..200 {
            if server.has_device().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for device connection");
    }

    fn assert_raw(reading: &Reading, temperature: f64, humidity: f64) {
        match reading.measurement {
            Measurement::Raw {
                temperature: t,
                humidity: h,
            } => {
                assert_eq!(t, temperature);
                assert_eq!(h, humidity);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_data_line() {
        let (server, mut rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"DATA 21.5 60.2\n").await.unwrap();

        let readings = wait_for_readings(&mut rx, 1).await;
        assert_raw(&readings[0], 21.5, 60.2);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stats_line() {
        let (server, mut rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(b"STATS 21.0 23.5 19.2 55.0 60.0 50.0\n")
            .await
            .unwrap();

        let readings = wait_for_readings(&mut rx, 1).await;
        match readings[0].measurement {
            Measurement::Aggregate(stats) => {
                assert_eq!(stats.temp_avg, 21.0);
                assert_eq!(stats.temp_max, 23.5);
                assert_eq!(stats.temp_min, 19.2);
                assert_eq!(stats.hum_avg, 55.0);
                assert_eq!(stats.hum_max, 60.0);
                assert_eq!(stats.hum_min, 50.0);
            }
            other => panic!("unexpected: {:?}", other),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_line_split_across_segments() {
        let (server, mut rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"DATA 2").await.unwrap();
        client.flush().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        client.write_all(b"2.5 55.0\n").await.unwrap();

        let readings = wait_for_readings(&mut rx, 1).await;
        assert_eq!(readings.len(), 1);
        assert_raw(&readings[0], 22.5, 55.0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_two_lines_in_one_segment() {
        let (server, mut rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"DATA 1 2\nDATA 3 4\n").await.unwrap();

        let readings = wait_for_readings(&mut rx, 2).await;
        assert_raw(&readings[0], 1.0, 2.0);
        assert_raw(&readings[1], 3.0, 4.0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_tag_keeps_connection_open() {
        let (server, mut rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"FOO bar\n").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(rx.drain().is_empty());

        // The same connection must keep accepting further lines
        client.write_all(b"DATA 1 2\n").await.unwrap();
        let readings = wait_for_readings(&mut rx, 1).await;
        assert_raw(&readings[0], 1.0, 2.0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_command_without_client() {
        let (server, _rx) = start_test_server().await;

        // Must neither block nor fail
        timeout(Duration::from_millis(200), server.send_command(&Command::Start))
            .await
            .expect("send_command blocked with no client");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_device_receives_command() {
        let (server, _rx) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_device(&server).await;

        server.send_command(&Command::SetFreq(1000)).await;

        let mut buf = BytesMut::new();
        timeout(Duration::from_secs(2), async {
            while !buf.iter().any(|&b| b == b'\n') {
                client.read_buf(&mut buf).await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(&buf[..], b"SET_FREQ 1000\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_old() {
        let (server, _rx) = start_test_server().await;

        let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_device(&server).await;

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();

        // The superseded connection is shut down and sees EOF
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Commands now reach the new connection
        server.send_command(&Command::Start).await;
        let mut line = BytesMut::new();
        timeout(Duration::from_secs(2), async {
            while !line.iter().any(|&b| b == b'\n') {
                second.read_buf(&mut line).await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(&line[..], b"START\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_clears_current_slot() {
        let (server, _rx) = start_test_server().await;

        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_device(&server).await;

        drop(client);
        for _ in 0..200 {
            if !server.has_device().await {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.has_device().await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_port_rebindable_after_stop() {
        let (server, _rx) = start_test_server().await;
        let addr = server.local_addr().to_string();

        server.stop().await;

        let (tx, _rx2) = ingest::queue(8);
        let second = Server::start(&addr, tx)
            .await
            .expect("port not rebindable after stop");
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (server, _rx) = start_test_server().await;
        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_error_on_occupied_port() {
        let (server, _rx) = start_test_server().await;
        let addr = server.local_addr().to_string();

        let (tx, _rx2) = ingest::queue(8);
        let err = Server::start(&addr, tx).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));

        server.stop().await;
    }
}
