//! One multiplexed socket connection.
//!
//! A [`Connection`] owns the outbound pipeline of a socket (the [`CommandQueue`], the
//! [`PendingCalls`] table, the command pool and the [`Sender`] thread) plus a receive
//! thread that feeds results back into the callback table (client side) or dispatches
//! requests to a [`Handler`] (server side).
//!
//! # Teardown
//! [`Connection::dispose`] is idempotent and may be triggered by the owner, by the sender
//! on a socket failure, or by the receiver when the peer goes away. It closes the queue,
//! closes the callback table and resolves every call that was still queued or waiting
//! for a response with [`ReturnType::ClientDisposed`], then shuts the socket down so both
//! threads exit.
use std::{
    io::BufReader,
    net::{Shutdown, SocketAddr, TcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::{
    command::{CHECK_COMMAND, Command, WaitSlot},
    config::ConnectionConfig,
    pool::{BufferPool, CommandPool, RingPool},
};

use super::{
    CommandQueue, PendingCalls, RawReturn, ReturnType, Sender, TransportError,
    frame::{FrameReader, RequestRecord},
    server::{Handler, ServerContext},
    thread::ThreadPool,
    transport::configure_stream,
};

/// State shared between a connection's owner, its sender and its receiver.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) queue: CommandQueue,
    pub(crate) pending: PendingCalls,
    pub(crate) commands: CommandPool,
    pub(crate) waiters: RingPool<Arc<WaitSlot>>,
    disposed: AtomicBool,
    send_count: AtomicU64,
    socket: Mutex<Option<TcpStream>>,
}

impl Shared {
    pub(crate) fn new(config: Arc<ConnectionConfig>) -> Self {
        Self {
            queue: CommandQueue::with_capacity(config.command_pool_capacity),
            pending: PendingCalls::new(),
            commands: CommandPool::new(
                config.command_pool_capacity,
                config.max_outstanding_commands,
                config.send_buffer_size,
            ),
            waiters: RingPool::new(config.command_pool_capacity),
            disposed: AtomicBool::new(false),
            send_count: AtomicU64::new(0),
            socket: Mutex::new(None),
            config,
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn disposed_flag(&self) -> &AtomicBool {
        &self.disposed
    }

    pub(crate) fn record_send(&self) {
        self.send_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    /// Releases a command that will never be built, resolving its call if it still has one.
    pub(crate) fn abandon(&self, command: Box<Command>) {
        if command.has_callback() {
            if let Some(completion) = self.pending.take(command.index()) {
                completion.complete(RawReturn::disposed());
            }
        }
        self.commands.release(command);
    }

    /// Queues a response record for request `index`.
    ///
    /// Replies are not bound by `max_outstanding_commands`: the peer is already waiting on
    /// `index`, so the only way a reply is refused is a disposed connection.
    pub(crate) fn reply(&self, index: u32, raw: RawReturn) -> Result<(), TransportError> {
        let mut command = self.commands.acquire_unbounded();
        command.set_reply(index, raw.kind);
        command.payload_mut().extend_from_slice(&raw.payload);
        self.queue.push(command).map_err(|command| {
            self.commands.release(command);
            TransportError::Disposed
        })
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for command in self.queue.close() {
            self.commands.release(command);
        }
        let outstanding = self.pending.close();
        if !outstanding.is_empty() {
            debug!("releasing {} outstanding calls", outstanding.len());
        }
        for completion in outstanding {
            completion.complete(RawReturn::disposed());
        }

        if let Some(socket) = self.socket.lock().take() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!("socket shutdown: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A started connection: queue, sender thread and receive thread over one socket.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    role: Role,
    peer: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Connects to `config.host:config.port` and starts the client side.
    pub fn connect(
        config: Arc<ConnectionConfig>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let stream = TcpStream::connect(config.address())?;
        Self::start_client(stream, config, buffers)
    }

    /// Starts the client side over an already connected stream.
    pub fn start_client(
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self, TransportError> {
        let heartbeat = (!config.check_interval.is_zero()).then_some(config.check_interval);
        Self::start(stream, config, buffers, Role::Client, heartbeat, receive_responses)
    }

    /// Starts the server side of an accepted stream.
    pub(crate) fn start_server(
        stream: TcpStream,
        context: &ServerContext,
    ) -> Result<Self, TransportError> {
        let handler = Arc::clone(&context.handler);
        let workers = Arc::clone(&context.workers);
        Self::start(
            stream,
            Arc::clone(&context.config),
            Arc::clone(&context.buffers),
            Role::Server,
            None,
            move |shared, stream| receive_requests(shared, stream, handler, workers),
        )
    }

    fn start<F>(
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        buffers: Arc<BufferPool>,
        role: Role,
        heartbeat: Option<std::time::Duration>,
        receive: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce(Arc<Shared>, TcpStream) + Send + 'static,
    {
        configure_stream(&stream)?;
        let peer = stream.peer_addr().ok();
        let shared = Arc::new(Shared::new(config));
        *shared.socket.lock() = Some(stream.try_clone()?);

        let sender = Sender::new(Arc::clone(&shared), stream.try_clone()?, buffers, heartbeat);
        let mut threads = Vec::with_capacity(2);
        threads.push(
            thread::Builder::new()
                .name("skein-sender".to_string())
                .spawn(move || sender.run())?,
        );

        let receiver_shared = Arc::clone(&shared);
        match thread::Builder::new()
            .name("skein-receiver".to_string())
            .spawn(move || receive(receiver_shared, stream))
        {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                shared.dispose();
                return Err(e.into());
            }
        }

        debug!("started {role:?} connection with {peer:?}");
        Ok(Self {
            shared,
            role,
            peer,
            threads,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Tears the connection down; every outstanding call resolves with `ClientDisposed`.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Number of batches fully written to the socket.
    pub fn send_count(&self) -> u64 {
        self.shared.send_count()
    }

    /// Calls queued or awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Disposes the connection and waits for its threads to exit.
    pub fn close(mut self) {
        self.shared.dispose();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("connection thread panicked");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

fn receive_responses(shared: Arc<Shared>, stream: TcpStream) {
    let mut frames = FrameReader::new(BufReader::new(stream), shared.config.max_input_size);
    loop {
        match frames.read_response() {
            Ok(Some(record)) => {
                let raw = RawReturn::new(record.kind, record.payload);
                if !shared.pending.complete(record.index, raw) {
                    warn!("response for unknown callback index {}", record.index);
                }
            }
            Ok(None) => {
                debug!("connection closed by server");
                break;
            }
            Err(e) => {
                if !shared.is_disposed() {
                    error!("failed to receive response: {e}");
                }
                break;
            }
        }
    }
    shared.dispose();
}

fn receive_requests(
    shared: Arc<Shared>,
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    workers: Arc<ThreadPool>,
) {
    let mut frames = FrameReader::new(BufReader::new(stream), shared.config.max_input_size);
    loop {
        match frames.read_request() {
            Ok(Some(record)) if record.code == CHECK_COMMAND => trace!("heartbeat received"),
            Ok(Some(record)) => {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                let job = move || dispatch(&shared, handler.as_ref(), record);
                if let Err(e) = workers.execute(job) {
                    error!("failed to dispatch request: {e}");
                    break;
                }
            }
            Ok(None) => {
                debug!("connection closed by client");
                break;
            }
            Err(e) => {
                if !shared.is_disposed() {
                    error!("failed to receive request: {e}");
                }
                break;
            }
        }
    }
    shared.dispose();
}

fn dispatch(shared: &Shared, handler: &dyn Handler, record: RequestRecord) {
    let raw = match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&record))) {
        Ok(raw) => raw,
        Err(_) => {
            error!("handler panicked on call {}", record.code);
            ReturnType::ServerException.into()
        }
    };
    if !record.expects_response() {
        if raw.kind != ReturnType::Success {
            debug!("send-only call {} returned {:?}", record.code, raw.kind);
        }
        return;
    }
    if let Err(e) = shared.reply(record.index, raw) {
        // The peer only learns about a lost reply when the connection goes away.
        debug!("cannot reply to call {}: {e}", record.code);
        shared.dispose();
    }
}
