//! TCP transport on tokio
//!
//! Each connection gets a writer task fed through an unbounded channel and a
//! reader task. The writer reports every segment back to the session once it
//! has been written, which gives sessions the one-in-flight completion they
//! expect. Sessions themselves stay synchronous; only the socket work runs on
//! the runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flowlink_core::{FlowlinkError, LinkError, Result};

use crate::link::{ClientLink, Connector, ServerLink};
use crate::session::{LinkSession, SessionTransport};

const READ_CHUNK: usize = 16 * 1024;

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

/// The tokio runtime carrying socket I/O
pub struct TcpRuntime {
    runtime: Runtime,
}

impl TcpRuntime {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("flowlink-io")
            .enable_all()
            .build()
            .map_err(LinkError::NetworkIo)?;
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Stop the I/O tasks, waiting at most `timeout`
    pub fn shutdown(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
    }
}

// ----------------------------------------------------------------------------
// Connection Transport
// ----------------------------------------------------------------------------

enum WriteCommand {
    Segment(Vec<u8>),
    Close,
}

/// Session transport over one TCP stream
pub struct TcpTransport {
    remote: String,
    commands: mpsc::UnboundedSender<WriteCommand>,
    closing: AtomicBool,
}

/// Socket halves waiting for their session
pub struct TcpBinding {
    handle: Handle,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    commands: mpsc::UnboundedReceiver<WriteCommand>,
    remote: String,
}

impl TcpTransport {
    /// Split `stream` into a transport for the session and the I/O halves
    /// that start once the session exists
    pub fn wrap(handle: &Handle, stream: TcpStream) -> (Arc<Self>, TcpBinding) {
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", remote, e);
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            remote: remote.clone(),
            commands: tx,
            closing: AtomicBool::new(false),
        });
        let binding = TcpBinding {
            handle: handle.clone(),
            reader,
            writer,
            commands: rx,
            remote,
        };
        (transport, binding)
    }
}

impl SessionTransport for TcpTransport {
    fn send(&self, segment: Vec<u8>) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected { handle: 0 }.into());
        }
        self.commands
            .send(WriteCommand::Segment(segment))
            .map_err(|_| FlowlinkError::connection_failed(&self.remote, "writer stopped"))
    }

    fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(WriteCommand::Close);
        }
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}

impl TcpBinding {
    /// Start reading and writing on behalf of `session`
    pub fn start(self, session: &Arc<LinkSession>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(session);
        debug!("Starting I/O for {}", self.remote);
        self.handle
            .spawn(write_loop(self.writer, self.commands, weak.clone(), stop_tx));
        self.handle.spawn(read_loop(self.reader, weak, stop_rx));
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    session: Weak<LinkSession>,
    stop: watch::Sender<bool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Segment(bytes) => {
                let result: Result<()> = writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| LinkError::NetworkIo(e).into());
                let failed = result.is_err();
                if let Some(session) = session.upgrade() {
                    session.on_send_completed(result);
                }
                if failed {
                    break;
                }
            }
            WriteCommand::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    let _ = stop.send(true);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    session: Weak<LinkSession>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => match session.upgrade() {
                        Some(session) => session.on_received(&buffer[..n]),
                        None => break,
                    },
                    Err(e) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
    if let Some(session) = session.upgrade() {
        session.on_transport_closed();
    }
}

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

/// Accept loop feeding a server link
pub struct TcpServerTransport {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
}

impl TcpServerTransport {
    /// Bind `addr` and hand every accepted stream to `server`
    pub fn listen(runtime: &TcpRuntime, addr: SocketAddr, server: ServerLink) -> Result<Self> {
        let handle = runtime.handle().clone();
        let listener = handle
            .block_on(TcpListener::bind(addr))
            .map_err(LinkError::NetworkIo)?;
        let local_addr = listener.local_addr().map_err(LinkError::NetworkIo)?;
        let (stop, stop_rx) = watch::channel(false);
        info!("Link {} listening on {}", server.name(), local_addr);
        handle.spawn(accept_loop(handle.clone(), listener, server, stop_rx));
        Ok(Self { local_addr, stop })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; established sessions are unaffected
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for TcpServerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    handle: Handle,
    listener: TcpListener,
    server: ServerLink,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted {}", peer);
                    let (transport, binding) = TcpTransport::wrap(&handle, stream);
                    match server.accept(transport) {
                        Ok(session) => binding.start(&session),
                        Err(e) => {
                            warn!("Dropping connection from {}: {}", peer, e);
                        }
                    }
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = stop.changed() => break,
        }
    }
    debug!("Accept loop for {} stopped", server.name());
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// Opens TCP connections for a client link
pub struct TcpConnector {
    handle: Handle,
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(runtime: &TcpRuntime, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            handle: runtime.handle().clone(),
            addr,
        })
    }
}

impl Connector for TcpConnector {
    fn connect(&self, link: ClientLink) {
        let addr = self.addr;
        let handle = self.handle.clone();
        let timeout = link.core().config().connect_timeout;
        self.handle.spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let (transport, binding) = TcpTransport::wrap(&handle, stream);
                    match link.attach(transport) {
                        Ok(session) => binding.start(&session),
                        Err(e) => debug!("Link {} refused the connection: {}", link.name(), e),
                    }
                }
                Ok(Err(e)) => link.connect_failed(&e.to_string()),
                Err(_) => link.connect_failed("connect timed out"),
            }
        });
    }
}
