//! Per-connection drain loop.
//!
//! Each connection runs exactly one [`Sender`] on its own thread. It sleeps on the queue's
//! wake handle, takes the queued chain, builds commands into the current batch buffer and
//! writes the batch to the socket:
//!
//! ```text
//! WaitingForWork ──signal──► Draining ──batch ready──► Sending ──┬─► WaitingForWork
//!       ▲                       ▲                                 │
//!       └──── watchdog ─────────┴──────── more queued ◄───────────┘
//! ```
//!
//! # Coalescing
//! When the chain runs dry the batch is not necessarily sent at once. With an output
//! sleep configured the sender naps for that long so more commands can join the batch;
//! without one it flushes as soon as nothing else is pending. A batch that carries a
//! blocking caller only yields instead of sleeping, and a command flagged
//! [`SEND_NOW`](crate::CommandFlags::SEND_NOW) cuts the batch immediately.
//!
//! # Buffers
//! The batch is built into a pooled buffer of `send_buffer_size` bytes. A single record
//! larger than that grows the buffer; a grown buffer within `send_buffer_max_size` is
//! kept for the following batches, a larger one is released after the batch is sent.
//!
//! # Failure
//! A socket error ends the loop and disposes the connection, which resolves every call
//! still queued or awaiting a response. Buffers and unbuilt commands are released on
//! every exit path.
use std::{
    collections::VecDeque,
    io::Write,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, trace};

use crate::{
    command::{BuildInfo, Command},
    pool::BufferPool,
};

use super::{TransportError, connection::Shared, frame, transport::send_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// The next command does not fit the batch.
    Full,
    /// A command asked for the batch to go out now.
    SendNow,
    /// The chain is empty.
    Exhausted,
}

pub struct Sender<W: Write> {
    shared: Arc<Shared>,
    writer: W,
    buffers: Arc<BufferPool>,
    heartbeat: Option<Duration>,
    chain: VecDeque<Box<Command>>,
    output: Vec<u8>,
    compressed: Vec<u8>,
    info: BuildInfo,
    last_send: Instant,
}

impl<W: Write> Sender<W> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        writer: W,
        buffers: Arc<BufferPool>,
        heartbeat: Option<Duration>,
    ) -> Self {
        let chain = VecDeque::with_capacity(shared.config.command_pool_capacity);
        Self {
            output: buffers.acquire(),
            shared,
            writer,
            buffers,
            heartbeat,
            chain,
            compressed: Vec::new(),
            info: BuildInfo::default(),
            last_send: Instant::now(),
        }
    }

    /// Runs the drain loop on the calling thread until the connection is disposed or the
    /// socket fails.
    pub fn run(mut self) {
        self.shared.queue.signal().register();
        match self.drain() {
            Ok(()) | Err(TransportError::Disposed) => {}
            Err(e) => {
                if !self.shared.is_disposed() {
                    error!("connection sender failed: {e}");
                }
                self.shared.dispose();
            }
        }
        self.finish();
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        let output_sleep = self.shared.config.output_sleep;
        let mut sleep = output_sleep;

        'wait: loop {
            if !self.wait_for_work() {
                return Ok(());
            }
            loop {
                let stop = self.build_batch()?;
                if stop == Stop::Exhausted {
                    if self.shared.queue.has_new() {
                        continue 'wait;
                    }
                    if !self.coalesce(&mut sleep) {
                        continue 'wait;
                    }
                }

                self.flush()?;
                sleep = output_sleep;
                if self.chain.is_empty() {
                    continue 'wait;
                }
            }
        }
    }

    /// Blocks until the queue signals, then moves the queued chain over. Runs the
    /// heartbeat watchdog whenever the wait times out. Returns `false` once disposed.
    fn wait_for_work(&mut self) -> bool {
        loop {
            let signaled = self.shared.queue.signal().wait(self.watchdog_timeout());
            if self.shared.is_disposed() {
                return false;
            }
            if signaled {
                self.shared.queue.take(&mut self.chain);
                return true;
            }
            self.check();
        }
    }

    fn watchdog_timeout(&self) -> Option<Duration> {
        let interval = self.heartbeat?;
        Some(interval.saturating_sub(self.last_send.elapsed()))
    }

    /// Queues a heartbeat if nothing was sent for a full interval and nothing is queued.
    fn check(&mut self) {
        let Some(interval) = self.heartbeat else {
            return;
        };
        if self.last_send.elapsed() < interval {
            return;
        }
        match self.shared.commands.acquire() {
            Ok(mut command) => {
                command.set_check();
                match self.shared.queue.push_if_idle(command) {
                    Ok(()) => trace!("queued heartbeat"),
                    Err(command) => self.shared.commands.release(command),
                }
            }
            Err(e) => debug!("skipping heartbeat: {e}"),
        }
        self.last_send = Instant::now();
    }

    fn build_batch(&mut self) -> Result<Stop, TransportError> {
        let capacity = self.shared.config.send_buffer_size;
        while let Some(command) = self.chain.pop_front() {
            match command.build(&mut self.output, capacity, &mut self.info) {
                Ok(true) => self.shared.commands.release(command),
                Ok(false) => {
                    self.chain.push_front(command);
                    return Ok(Stop::Full);
                }
                Err(e) => {
                    self.shared.abandon(command);
                    return Err(e);
                }
            }
            if self.info.send_now {
                return Ok(Stop::SendNow);
            }
        }
        Ok(Stop::Exhausted)
    }

    /// Decides whether a batch whose chain ran dry goes out now. Returns `false` when the
    /// loop should go back to waiting for more commands.
    fn coalesce(&self, sleep: &mut Option<Duration>) -> bool {
        match *sleep {
            None if !self.info.has_waiter => return !self.output.is_empty(),
            Some(delay) if !self.info.has_waiter => thread::sleep(delay),
            _ => thread::yield_now(),
        }
        if self.shared.queue.has_new() || self.output.is_empty() {
            *sleep = Some(Duration::ZERO);
            return false;
        }
        true
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let config = &self.shared.config;
        let length = self.output.len();

        let compress = config.min_compress_size > 0
            && length >= config.min_compress_size
            && !self.info.is_verify;
        let compressed = compress
            && match frame::compress(&self.output, &mut self.compressed, config.compression_level) {
                Ok(compressed) => compressed,
                Err(e) => {
                    debug!("compression failed, sending raw batch: {e}");
                    false
                }
            };

        let data = if compressed {
            &self.compressed
        } else {
            &self.output
        };
        send_all(&mut self.writer, data, self.shared.disposed_flag())?;

        trace!(
            "sent {} commands in {} bytes (raw {length})",
            self.info.count,
            data.len()
        );
        self.shared.record_send();
        self.last_send = Instant::now();
        self.info.clear();
        self.output.clear();
        self.recycle_buffers();
        Ok(())
    }

    /// Keeps a grown batch buffer for the next batch if it is within the configured
    /// maximum, otherwise swaps it for a regular pooled buffer.
    fn recycle_buffers(&mut self) {
        let max = self.shared.config.send_buffer_max_size;
        if self.compressed.capacity() > max {
            self.compressed = Vec::new();
        }
        if self.output.capacity() > max {
            debug!(
                "releasing oversized send buffer of {} bytes",
                self.output.capacity()
            );
            self.output = self.buffers.acquire();
        }
    }

    fn finish(&mut self) {
        let shared = &self.shared;
        for command in self.chain.drain(..) {
            shared.abandon(command);
        }
        self.buffers.release(std::mem::take(&mut self.output));
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use parking_lot::Mutex;

    use crate::{
        command::{CHECK_COMMAND, CommandFlags, CommandInfo, CommandKind, Completion, WaitSlot},
        config::ConnectionConfig,
        protocol::{
            ReturnType,
            frame::{FrameReader, NO_CALLBACK, RequestRecord},
        },
    };

    use super::*;

    static NOTIFY: CommandInfo = CommandInfo::new(0, CommandFlags::NONE);
    static QUERY: CommandInfo = CommandInfo::new(1, CommandFlags::NONE);
    static URGENT: CommandInfo = CommandInfo::new(2, CommandFlags::SEND_NOW);
    static VERIFY: CommandInfo = CommandInfo::new(3, CommandFlags::VERIFY);

    /// Records every write call as one batch.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Recorder {
        fn batches(&self) -> Vec<Vec<u8>> {
            self.0.lock().clone()
        }

        fn records(&self) -> Vec<RequestRecord> {
            let stream = self.batches().concat();
            let mut reader = FrameReader::new(stream.as_slice(), usize::MAX >> 1);
            std::iter::from_fn(|| reader.read_request().unwrap()).collect()
        }
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::ConnectionReset.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn shared(config: ConnectionConfig) -> Arc<Shared> {
        Arc::new(Shared::new(Arc::new(ConnectionConfig {
            check_interval: Duration::ZERO,
            ..config
        })))
    }

    fn sender<W: Write>(shared: &Arc<Shared>, writer: W) -> Sender<W> {
        let buffers = Arc::new(BufferPool::new(4, shared.config.send_buffer_size));
        Sender::new(Arc::clone(shared), writer, buffers, None)
    }

    fn send_only(shared: &Shared, info: CommandInfo, payload: &[u8]) {
        let mut command = shared.commands.acquire().unwrap();
        command.set_request(CommandKind::InputOnly, info, NO_CALLBACK, false);
        command.payload_mut().extend_from_slice(payload);
        shared.queue.push(command).unwrap();
    }

    fn waiting_call(shared: &Shared, info: CommandInfo) -> Arc<WaitSlot> {
        let slot = Arc::new(WaitSlot::new());
        let index = shared
            .pending
            .register(Completion::Wait(Arc::clone(&slot)))
            .unwrap();
        let mut command = shared.commands.acquire().unwrap();
        command.set_request(CommandKind::Call, info, index, true);
        shared.queue.push(command).unwrap();
        slot
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn<W: Write + Send + 'static>(sender: Sender<W>) -> thread::JoinHandle<()> {
        thread::spawn(move || sender.run())
    }

    #[test]
    fn queued_calls_share_one_batch_with_waiter() {
        let shared = shared(ConnectionConfig {
            output_sleep: Some(Duration::ZERO),
            ..Default::default()
        });
        for n in 0..3_u8 {
            send_only(&shared, NOTIFY, &[n]);
        }
        let slot = waiting_call(&shared, QUERY);

        let recorder = Recorder::default();
        let handle = spawn(sender(&shared, recorder.clone()));
        wait_until(|| shared.send_count() == 1);
        shared.dispose();
        handle.join().unwrap();

        assert_eq!(recorder.batches().len(), 1);
        let codes: Vec<i32> = recorder.records().iter().map(|r| r.code).collect();
        assert_eq!(
            codes,
            vec![NOTIFY.code(), NOTIFY.code(), NOTIFY.code(), QUERY.code()]
        );
        assert_eq!(slot.wait().kind, ReturnType::ClientDisposed);
    }

    #[test]
    fn fifo_across_batches() {
        let shared = shared(ConnectionConfig {
            send_buffer_size: 24,
            send_buffer_max_size: 1024,
            ..Default::default()
        });
        for n in 0..5_u8 {
            send_only(&shared, NOTIFY, &[n; 4]);
        }

        let recorder = Recorder::default();
        let handle = spawn(sender(&shared, recorder.clone()));
        wait_until(|| recorder.records().len() == 5);
        shared.dispose();
        handle.join().unwrap();

        // Each 20-byte record fills a 24-byte batch on its own.
        assert_eq!(recorder.batches().len(), 5);
        let order: Vec<u8> = recorder.records().iter().map(|r| r.payload[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(shared.commands.live(), 0);
    }

    #[test]
    fn send_now_cuts_the_batch() {
        let shared = shared(ConnectionConfig::default());
        send_only(&shared, NOTIFY, b"a");
        send_only(&shared, URGENT, b"b");
        send_only(&shared, NOTIFY, b"c");

        let mut sender = sender(&shared, Recorder::default());
        shared.queue.take(&mut sender.chain);
        assert_eq!(sender.build_batch().unwrap(), Stop::SendNow);
        assert_eq!(sender.info.count, 2);
        assert_eq!(sender.chain.len(), 1);
    }

    #[test]
    fn concurrent_producers_all_sent_once() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 250;

        let shared = shared(ConnectionConfig {
            send_buffer_size: 256,
            ..Default::default()
        });
        let recorder = Recorder::default();
        let handle = spawn(sender(&shared, recorder.clone()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for n in 0..PER_PRODUCER {
                        let id = producer * PER_PRODUCER + n;
                        send_only(&shared, NOTIFY, &id.to_le_bytes());
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        wait_until(|| recorder.records().len() >= total);
        shared.dispose();
        handle.join().unwrap();

        let mut ids: Vec<u32> = recorder
            .records()
            .iter()
            .map(|r| u32::from_le_bytes(r.payload[..4].try_into().unwrap()))
            .collect();
        assert_eq!(ids.len(), total);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn large_batches_are_compressed() {
        let shared = shared(ConnectionConfig {
            min_compress_size: 128,
            ..Default::default()
        });
        send_only(&shared, NOTIFY, &b"abcd".repeat(100));
        send_only(&shared, NOTIFY, b"small");

        let recorder = Recorder::default();
        let mut sender = sender(&shared, recorder.clone());
        shared.queue.take(&mut sender.chain);
        sender.build_batch().unwrap();
        sender.flush().unwrap();

        let batch = &recorder.batches()[0];
        let lead = i32::from_le_bytes(batch[..4].try_into().unwrap());
        assert!(lead < 0);
        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"abcd".repeat(100));
        assert_eq!(records[1].payload, b"small");
    }

    #[test]
    fn small_batches_carry_no_compression_header() {
        let shared = shared(ConnectionConfig {
            min_compress_size: 1024,
            ..Default::default()
        });
        send_only(&shared, NOTIFY, &[0; 64]);

        let recorder = Recorder::default();
        let mut sender = sender(&shared, recorder.clone());
        shared.queue.take(&mut sender.chain);
        sender.build_batch().unwrap();
        sender.flush().unwrap();

        let batch = &recorder.batches()[0];
        assert_eq!(
            i32::from_le_bytes(batch[..4].try_into().unwrap()),
            NOTIFY.code()
        );
    }

    #[test]
    fn verify_batches_are_never_compressed() {
        let shared = shared(ConnectionConfig {
            min_compress_size: 16,
            ..Default::default()
        });
        send_only(&shared, VERIFY, &[0; 512]);

        let recorder = Recorder::default();
        let mut sender = sender(&shared, recorder.clone());
        shared.queue.take(&mut sender.chain);
        sender.build_batch().unwrap();
        sender.flush().unwrap();

        let batch = &recorder.batches()[0];
        assert_eq!(batch.len(), frame::REQUEST_HEADER_SIZE + 512);
    }

    #[test]
    fn grown_buffer_within_max_is_kept() {
        let shared = shared(ConnectionConfig {
            send_buffer_size: 64,
            send_buffer_max_size: 4096,
            ..Default::default()
        });
        send_only(&shared, NOTIFY, &[1; 300]);

        let mut sender = sender(&shared, Recorder::default());
        shared.queue.take(&mut sender.chain);
        sender.build_batch().unwrap();
        sender.flush().unwrap();

        assert!(sender.output.capacity() >= 300);
        assert!(sender.output.is_empty());
    }

    #[test]
    fn grown_buffer_past_max_is_released() {
        let shared = shared(ConnectionConfig {
            send_buffer_size: 64,
            send_buffer_max_size: 128,
            ..Default::default()
        });
        send_only(&shared, NOTIFY, &[1; 300]);

        let mut sender = sender(&shared, Recorder::default());
        shared.queue.take(&mut sender.chain);
        sender.build_batch().unwrap();
        sender.flush().unwrap();

        assert!(sender.output.capacity() < 300);
    }

    #[test]
    fn idle_connection_sends_heartbeat() {
        let shared = shared(ConnectionConfig::default());
        let recorder = Recorder::default();
        let buffers = Arc::new(BufferPool::new(1, shared.config.send_buffer_size));
        let sender = Sender::new(
            Arc::clone(&shared),
            recorder.clone(),
            buffers,
            Some(Duration::from_millis(20)),
        );

        let handle = spawn(sender);
        wait_until(|| !recorder.records().is_empty());
        shared.dispose();
        handle.join().unwrap();

        let record = &recorder.records()[0];
        assert_eq!(record.code, CHECK_COMMAND);
        assert_eq!(record.index, NO_CALLBACK);
    }

    #[test]
    fn socket_failure_disposes_connection() {
        let shared = shared(ConnectionConfig::default());
        let slot = waiting_call(&shared, QUERY);
        send_only(&shared, NOTIFY, b"x");

        let handle = spawn(sender(&shared, Broken));
        assert_eq!(slot.wait().kind, ReturnType::ClientDisposed);
        handle.join().unwrap();

        assert!(shared.is_disposed());
        assert_eq!(shared.commands.live(), 0);
        assert!(shared.pending.is_empty());
    }
}
