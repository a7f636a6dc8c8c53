//! TCP server that echoes packets back reversed.
//!
//! Each accepted connection gets its own handler task. A handler reads a
//! frame, verifies the packet checksum, reverses the payload in place and
//! writes it back as a frame of the same length. Handler failures are logged
//! and only end that connection.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use crate::config::ServerConfig;
use crate::error::{NetsumError, Result};
use crate::framing::{read_frame, write_frame};
use crate::packet::verify_packet;
use crate::throughput::Throughput;

/// Server instance
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
}

/// State shared between the accept loop, handlers and stop handles.
struct Shared {
    stopped: AtomicBool,
    wake: Notify,
    connection_limit: Arc<Semaphore>,
}

/// Cloneable handle used to stop a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stop accepting connections and cancel all handlers.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.connection_limit.close();
        self.shared.wake.notify_one();
    }

    /// Whether a stop has been requested.
    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let permits = config
            .max_connections
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);

        Server {
            config,
            shared: Arc::new(Shared {
                stopped: AtomicBool::new(false),
                wake: Notify::new(),
                connection_limit: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    /// Handle for stopping this server from another task.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the configured port and serve until stopped.
    pub async fn run(&self) -> Result<()> {
        let listener = bind_wildcard(self.config.port, self.config.backlog)?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until stopped or
    /// the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let (meter, _reporter) =
            Throughput::start(&Handle::current(), "server", self.config.report_interval);
        let mut handlers = JoinSet::new();

        let result = self.accept_loop(&listener, &meter, &mut handlers).await;
        if let Err(ref e) = result {
            error!(error = %e, "Accept loop failed");
        }

        self.handle().stop();
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        meter.stop();

        info!("Server stopped");
        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        meter: &Throughput,
        handlers: &mut JoinSet<()>,
    ) -> Result<()> {
        while !self.shared.stopped.load(Ordering::Acquire) {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shared.wake.notified() => continue,
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                    continue;
                }
            };

            // Waits while at the connection cap; fails once the server stops.
            let permit = match Arc::clone(&self.shared.connection_limit)
                .acquire_owned()
                .await
            {
                Ok(permit) => permit,
                Err(_) => {
                    drop(stream);
                    return Err(NetsumError::HandlerRejected);
                }
            };

            let connection = Connection {
                stream,
                peer,
                max_frame_size: self.config.max_frame_size,
                meter: meter.clone(),
                shared: Arc::clone(&self.shared),
                _permit: permit,
            };
            handlers.spawn(connection.run().instrument(tracing::info_span!("server", %peer)));
        }
        Ok(())
    }
}

/// One accepted client connection.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_size: usize,
    meter: Throughput,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    async fn run(self) {
        info!(peer = %self.peer, "Client connected");

        match self.serve().await {
            Ok(()) => debug!("Connection closed"),
            Err(NetsumError::ConnectionClosed) => info!("Client disconnected"),
            Err(e) => error!(error = %e, "Client handling failed"),
        }
    }

    async fn serve(self) -> Result<()> {
        self.stream.set_nodelay(true)?;
        let mut buffer = vec![0u8; self.max_frame_size];
        let (mut reader, mut writer) = self.stream.into_split();
        echo_packets(
            &mut reader,
            &mut writer,
            &mut buffer,
            &self.meter,
            &self.shared.stopped,
        )
        .await
    }
}

/// Echo reversed packets until `stopped` is set or an error occurs.
pub async fn echo_packets<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut [u8],
    meter: &Throughput,
    stopped: &AtomicBool,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while !stopped.load(Ordering::Acquire) {
        let length = read_frame(reader, buffer).await?;
        verify_packet(buffer, 0, length)?;
        buffer[..length].reverse();
        write_frame(writer, buffer, 0, length).await?;

        meter.add(length as u64);
    }
    Ok(())
}

/// Listen on all interfaces, dual-stack where the host supports IPv6.
fn bind_wildcard(port: u16, backlog: i32) -> std::io::Result<TcpListener> {
    match create_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), backlog) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!(error = %e, "IPv6 wildcard unavailable, using IPv4");
            create_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::exchange_round;
    use crate::framing::read_frame_header;
    use crate::packet::create_packet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            max_frame_size: 1024 * 1024,
            max_connections: None,
            backlog: 128,
            report_interval: Duration::from_secs(60),
        }
    }

    async fn start_server(config: ServerConfig) -> (SocketAddr, ServerHandle, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config);
        let handle = server.handle();
        let task = tokio::spawn(async move { server.serve(listener).await });
        (addr, handle, task)
    }

    #[tokio::test]
    async fn test_echo_reverses_whole_packet() {
        let (addr, handle, task) = start_server(test_config()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let mut packet = vec![0u8; 100];
        let mut response = vec![0u8; 100];
        exchange_round(&mut reader, &mut writer, &mut packet, &mut response, 0)
            .await
            .unwrap();

        // Header bytes are part of the reversal.
        let mut header = packet[..8].to_vec();
        header.reverse();
        assert_eq!(&response[92..], &header[..]);
        let reversed: Vec<u8> = packet.iter().rev().copied().collect();
        assert_eq!(response, reversed);

        for round in 1..5 {
            exchange_round(&mut reader, &mut writer, &mut packet, &mut response, round)
                .await
                .unwrap();
        }

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_packet_only_closes_its_connection() {
        let (addr, handle, task) = start_server(test_config()).await;

        let good = TcpStream::connect(addr).await.unwrap();
        let (mut good_reader, mut good_writer) = good.into_split();

        let mut bad = TcpStream::connect(addr).await.unwrap();
        let mut packet = vec![0u8; 64];
        create_packet(&mut packet, 0, 64, 7).unwrap();
        packet[40] ^= 0xff;
        write_frame(&mut bad, &packet, 0, 64).await.unwrap();

        // The handler drops the connection instead of answering.
        let mut rest = Vec::new();
        let closed = bad.read_to_end(&mut rest).await;
        assert!(closed.is_err() || rest.is_empty());

        let mut packet = vec![0u8; 256];
        let mut response = vec![0u8; 256];
        exchange_round(&mut good_reader, &mut good_writer, &mut packet, &mut response, 9)
            .await
            .unwrap();

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_handlers() {
        let (addr, handle, task) = start_server(test_config()).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        let mut other = TcpStream::connect(addr).await.unwrap();
        // Make sure both connections reached a handler.
        for stream in [&mut idle, &mut other] {
            let mut packet = vec![0u8; 32];
            create_packet(&mut packet, 0, 32, 1).unwrap();
            write_frame(stream, &packet, 0, 32).await.unwrap();
            assert_eq!(read_frame_header(stream).await.unwrap(), 32);
            let mut payload = [0u8; 32];
            stream.read_exact(&mut payload).await.unwrap();
        }

        handle.stop();
        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        let closed = idle.read_to_end(&mut rest).await;
        assert!(closed.is_err() || rest.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_connection() {
        let mut config = test_config();
        config.max_frame_size = 64;
        let (addr, handle, task) = start_server(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 0, 1, 0]).await.unwrap();
        let mut rest = Vec::new();
        let closed = stream.read_to_end(&mut rest).await;
        assert!(closed.is_err() || rest.is_empty());

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_cap_applies_backpressure() {
        let mut config = test_config();
        config.max_connections = Some(1);
        let (addr, handle, task) = start_server(config).await;

        let first = TcpStream::connect(addr).await.unwrap();
        let (mut first_reader, mut first_writer) = first.into_split();
        let mut packet = vec![0u8; 16];
        let mut response = vec![0u8; 16];
        exchange_round(&mut first_reader, &mut first_writer, &mut packet, &mut response, 0)
            .await
            .unwrap();

        // The second connection is accepted but waits for a handler slot.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut pending = vec![0u8; 16];
        create_packet(&mut pending, 0, 16, 0).unwrap();
        write_frame(&mut second, &pending, 0, 16).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            read_frame_header(&mut second),
        )
        .await;
        assert!(blocked.is_err());

        drop(first_reader);
        drop(first_writer);
        let mut echoed = vec![0u8; 16];
        let length = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut second, &mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(length, 16);

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_echo_loop_honors_stop_flag() {
        let (meter, _reporter) =
            Throughput::start(&Handle::current(), "test", Duration::from_secs(60));
        let stopped = AtomicBool::new(true);
        let mut reader = tokio_test::io::Builder::new().build();
        let mut writer = tokio_test::io::Builder::new().build();
        let mut buffer = [0u8; 16];

        echo_packets(&mut reader, &mut writer, &mut buffer, &meter, &stopped)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_echo_loop_counts_bytes() {
        let (meter, _reporter) =
            Throughput::start(&Handle::current(), "test", Duration::from_secs(60));
        let stopped = AtomicBool::new(false);

        let mut request = Vec::new();
        let mut packet = vec![0u8; 20];
        create_packet(&mut packet, 0, 20, 5).unwrap();
        write_frame(&mut request, &packet, 0, 20).await.unwrap();

        let mut reader = std::io::Cursor::new(request);
        let mut writer = Vec::new();
        let mut buffer = [0u8; 64];

        let result = echo_packets(&mut reader, &mut writer, &mut buffer, &meter, &stopped).await;
        assert!(matches!(result, Err(NetsumError::ConnectionClosed)));

        assert_eq!(&writer[..4], &[0, 0, 0, 20]);
        let reversed: Vec<u8> = packet.iter().rev().copied().collect();
        assert_eq!(&writer[4..], &reversed[..]);
        assert!(meter.rate() > 0.0);
    }

    #[tokio::test]
    async fn test_short_payload_is_hard_failure() {
        let (meter, _reporter) =
            Throughput::start(&Handle::current(), "test", Duration::from_secs(60));
        let stopped = AtomicBool::new(false);
        let mut reader = std::io::Cursor::new(vec![0, 0, 0, 100, 1, 2, 3]);
        let mut writer = Vec::new();
        let mut buffer = [0u8; 256];

        let result = echo_packets(&mut reader, &mut writer, &mut buffer, &meter, &stopped).await;
        assert!(matches!(result, Err(NetsumError::Truncated { expected: 100 })));
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_at_cap_rejects_pending_connection() {
        let mut config = test_config();
        config.max_connections = Some(1);
        let (addr, handle, task) = start_server(config).await;

        let first = TcpStream::connect(addr).await.unwrap();
        let (mut first_reader, mut first_writer) = first.into_split();
        let mut packet = vec![0u8; 16];
        let mut response = vec![0u8; 16];
        exchange_round(&mut first_reader, &mut first_writer, &mut packet, &mut response, 0)
            .await
            .unwrap();

        // Accepted, then parked waiting for a handler slot.
        let mut second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetsumError::HandlerRejected)));

        let mut rest = Vec::new();
        let closed = second.read_to_end(&mut rest).await;
        assert!(closed.is_err() || rest.is_empty());
    }

    #[tokio::test]
    async fn test_bind_wildcard() {
        let listener = bind_wildcard(0, 16).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);

        // Dual-stack or IPv4-only, the IPv4 loopback must reach it.
        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        let (connected, accepted) = tokio::join!(client, listener.accept());
        connected.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn test_create_listener() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
