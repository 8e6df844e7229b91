use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::{OwnedReadHalf, OwnedWriteHalf}},
    sync::{Mutex, watch},
    task::{JoinHandle, JoinSet},
};

use crate::{Error, Result, sap::Sap};

/// Per-frame server callback.
///
/// Invoked by a connection worker with the payload of one inbound frame; the
/// returned bytes are written back as the reply frame (`None` replies with an
/// empty frame).
pub type FrameHandler = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

struct ServerState {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

struct ClientState {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    stop: watch::Receiver<bool>,
}

/// Bidirectional byte-frame transport over TCP.
///
/// A frame is a 4-byte little-endian signed length followed by exactly that
/// many payload bytes; the empty frame is legal. The server side runs an
/// accept loop on a background task and one worker task per connection, so a
/// framing error on one connection never disturbs the others. The client
/// side keeps a single socket on which [`TcpTransport::send_request`]
/// exchanges one frame for one frame.
pub struct TcpTransport {
    handler: Arc<RwLock<Option<FrameHandler>>>,
    local: RwLock<Option<Sap>>,
    server: Mutex<Option<ServerState>>,
    client: Mutex<Option<ClientState>>,
    client_stop: RwLock<Option<watch::Sender<bool>>>,
    connected: AtomicBool,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            handler: Arc::new(RwLock::new(None)),
            local: RwLock::new(None),
            server: Mutex::new(None),
            client: Mutex::new(None),
            client_stop: RwLock::new(None),
            connected: AtomicBool::new(false),
            connect_timeout,
            max_frame_size,
        }
    }

    /// The resolved local SAP, available while the transport is open.
    ///
    /// Opening with port 0 picks a free port, so the returned SAP always
    /// carries the concrete one.
    pub fn sap(&self) -> Option<Sap> {
        self.local.read().clone()
    }

    pub fn server_mode(&self) -> bool {
        self.local.read().is_some()
    }

    pub fn client_mode(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_bound(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Installs the per-frame server callback.
    ///
    /// May be called before or after [`TcpTransport::open`]; the latest call
    /// wins and workers pick up the current callback on every frame.
    pub fn bind<F>(&self, callback: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(callback));
    }

    /// Binds and listens on `local_sap`, then starts the accept loop in a
    /// background task.
    pub async fn open(&self, local_sap: Sap) -> Result<()> {
        let Sap::Tcp { host, port } = &local_sap else {
            return Err(Error::TransportOpen(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a null sap cannot be opened",
            )));
        };

        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(Error::TransportOpen(io::Error::new(
                io::ErrorKind::AddrInUse,
                "transport is already open",
            )));
        }

        let listener = TcpListener::bind((host.as_str(), *port))
            .await
            .map_err(Error::TransportOpen)?;
        let local_addr = listener.local_addr().map_err(Error::TransportOpen)?;

        *self.local.write() = Some(Sap::tcp(host.clone(), local_addr.port()));
        log::info!("tcp server listening: interface={:?}", local_addr);

        let (shutdown, shutdown_signal) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            shutdown_signal,
            self.max_frame_size,
        ));

        *server = Some(ServerState {
            shutdown,
            accept_task,
        });

        Ok(())
    }

    /// Stops accepting, signals the connection workers to exit after their
    /// current frame and joins them, then releases the listening socket.
    pub async fn close(&self) {
        let state = self.server.lock().await.take();
        if let Some(state) = state {
            let _ = state.shutdown.send(true);
            let _ = state.accept_task.await;
            *self.local.write() = None;
        }
    }

    /// Opens one client socket to `remote_sap`.
    pub async fn connect(&self, remote_sap: &Sap) -> Result<()> {
        let Sap::Tcp { host, port } = remote_sap else {
            return Err(Error::TransportConnect(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a null sap cannot be connected",
            )));
        };

        let mut client = self.client.lock().await;
        let socket = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await
        .map_err(|_| {
            Error::TransportConnect(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
        })?
        .map_err(Error::TransportConnect)?;

        // Disable the Nagle algorithm, requests should leave as soon as the
        // frame is written.
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("tcp socket set nodelay failed!: addr={}:{}, err={}", host, port, e);
        }

        log::debug!("tcp socket connected: addr={}:{}", host, port);

        let (reader, writer) = socket.into_split();
        let (stop, stop_signal) = watch::channel(false);
        *self.client_stop.write() = Some(stop);
        *client = Some(ClientState {
            reader,
            writer,
            stop: stop_signal,
        });

        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Half-closes then drops the client socket; idempotent.
    ///
    /// An outstanding [`TcpTransport::send_request`] is aborted and fails
    /// with a transport error.
    pub async fn disconnect(&self) {
        if let Some(stop) = self.client_stop.write().take() {
            let _ = stop.send(true);
        }

        self.connected.store(false, Ordering::Release);

        let mut client = self.client.lock().await;
        if let Some(mut state) = client.take() {
            let _ = state.writer.shutdown().await;
            log::debug!("tcp socket disconnected by local endpoint");
        }
    }

    /// Writes one frame on the client socket and blocks until exactly one
    /// response frame is read back.
    pub async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut client = self.client.lock().await;
        let state = client.as_mut().ok_or(Error::TransportNotConnected)?;

        let mut stop = state.stop.clone();
        let ClientState { reader, writer, .. } = state;

        tokio::select! {
            ret = async {
                write_frame(writer, request).await?;
                read_frame(reader, self.max_frame_size).await
            } => ret,
            _ = stop.wait_for(|stopped| *stopped) => {
                Err(Error::TransportIo(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "transport disconnected while waiting for the response",
                )))
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        let config = crate::config::Config::default();
        Self::new(config.connect_timeout(), config.max_frame_size)
    }
}

/// Accept all connections on the listener until shutdown is signalled or the
/// listener fails, then drain the workers.
async fn accept_loop(
    listener: TcpListener,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    shutdown: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let local_addr = listener.local_addr().ok();
    let mut workers = JoinSet::new();
    let mut shutdown_wait = shutdown.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    log::info!(
                        "tcp socket accept: addr={:?}, interface={:?}",
                        addr,
                        local_addr,
                    );

                    // Disable the Nagle algorithm, replies should leave as
                    // soon as the frame is written.
                    if let Err(e) = socket.set_nodelay(true) {
                        log::error!("tcp socket set nodelay failed!: addr={}, err={}", addr, e);
                    }

                    workers.spawn(connection_worker(
                        socket,
                        addr,
                        handler.clone(),
                        shutdown.clone(),
                        max_frame_size,
                    ));
                }
                Err(e) => {
                    log::error!("tcp accept failed: err={}", e);
                    break;
                }
            },
            _ = shutdown_wait.wait_for(|stop| *stop) => break,
        }
    }

    drop(listener);
    while workers.join_next().await.is_some() {}
    log::info!("tcp server close: interface={:?}", local_addr);
}

/// One task per accepted connection: wait for a frame, deliver it to the
/// bound callback, write the returned frame back, repeat. Any framing error
/// closes only this connection.
async fn connection_worker(
    socket: TcpStream,
    addr: SocketAddr,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let frame = tokio::select! {
            ret = read_frame(&mut reader, max_frame_size) => match ret {
                Ok(frame) => frame,
                Err(e) => {
                    log::info!("tcp socket disconnect: addr={:?}, err={}", addr, e);
                    break;
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        };

        log::trace!("tcp socket receive: size={}, addr={:?}", frame.len(), addr);

        let callback = handler.read().clone();
        let response = match callback {
            Some(callback) => callback(&frame),
            None => {
                log::debug!("request received but no callback established: addr={:?}", addr);
                None
            }
        };

        let response = response.unwrap_or_default();
        if let Err(e) = write_frame(&mut writer, &response).await {
            log::warn!("tcp socket send failed: addr={:?}, err={}", addr, e);
            break;
        }

        log::trace!("tcp socket reply: size={}, addr={:?}", response.len(), addr);
    }
}

/// Writes a 4-byte little-endian length header followed by the payload.
pub(crate) async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > i32::MAX as usize {
        return Err(Error::TransportIo(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload does not fit the 4-byte header",
        )));
    }

    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_i32_le(data.len() as i32);
    frame.extend_from_slice(data);
    writer.write_all(&frame).await.map_err(Error::TransportIo)
}

/// Reads exactly one frame: a 4-byte little-endian signed length, then the
/// payload, looping until satisfied or the peer closes.
///
/// A short header read, a negative length and a length above
/// `max_frame_size` are all hard errors; the caller terminates the
/// connection.
pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .await
        .map_err(Error::TransportIo)?;

    let size = i32::from_le_bytes(header);
    if size < 0 || size as usize > max_frame_size {
        return Err(Error::TransportIo(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the transport limits", size),
        )));
    }

    let mut data = vec![0u8; size as usize];
    reader
        .read_exact(&mut data)
        .await
        .map_err(Error::TransportIo)?;

    Ok(data)
}
