//! Per-connection command queue.
//!
//! Producers on any thread append to the tail; the connection's single sender takes the
//! whole chain at once. The list is only touched inside a spin-guarded critical section
//! that does amortized O(1) work (push to the tail, or swap the chain out), so contention
//! is resolved by yielding rather than by a blocking mutex. A push only reallocates when a
//! burst outgrows both lists; `take` swaps them, so grown capacity keeps circulating
//! between the queue and the sender.
//!
//! The `new_data` flag records whether anything arrived since the sender last took the
//! chain. It is written only inside the critical section but may be read without it,
//! which lets the sender ask "is more work pending" without locking. A producer that
//! flips the flag from clear to set also wakes the sender through [`WaitHandle`].
use std::{
    collections::VecDeque,
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use spin::{mutex::SpinMutex, relax::Yield};

use crate::command::Command;

/// Auto-reset wake signal owned by one waiting thread.
#[derive(Debug, Default)]
pub struct WaitHandle {
    signaled: AtomicBool,
    waiter: OnceLock<Thread>,
}

impl WaitHandle {
    /// Binds the handle to the calling thread; only that thread may wait on it.
    pub fn register(&self) {
        if self.waiter.set(thread::current()).is_err() {
            log::warn!("wait handle registered twice");
        }
    }

    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
        if let Some(waiter) = self.waiter.get() {
            waiter.unpark();
        }
    }

    /// Waits until signaled or until `timeout` elapses; consumes the signal.
    /// Returns whether the handle was signaled.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.signaled.swap(false, Ordering::AcqRel) {
                return true;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.signaled.swap(false, Ordering::AcqRel);
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    commands: VecDeque<Box<Command>>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    state: SpinMutex<QueueState, Yield>,
    new_data: AtomicBool,
    signal: WaitHandle,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that holds `capacity` commands before its list has to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: SpinMutex::new(QueueState {
                commands: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ..Self::default()
        }
    }

    /// Appends `command` at the tail. Hands the command back if the queue was closed.
    pub fn push(&self, command: Box<Command>) -> Result<(), Box<Command>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(command);
        }
        state.commands.push_back(command);
        let was_new = self.new_data.swap(true, Ordering::AcqRel);
        drop(state);

        if !was_new {
            self.signal.set();
        }
        Ok(())
    }

    /// Appends `command` only if nothing has been queued since the sender last took the
    /// chain. Used for heartbeats, which are pointless next to real traffic.
    pub fn push_if_idle(&self, command: Box<Command>) -> Result<(), Box<Command>> {
        let mut state = self.state.lock();
        if state.closed || self.new_data.load(Ordering::Acquire) {
            return Err(command);
        }
        state.commands.push_back(command);
        self.new_data.store(true, Ordering::Release);
        drop(state);

        self.signal.set();
        Ok(())
    }

    /// Moves everything queued onto the end of `chain` and clears the new-data flag.
    /// Returns whether the flag was set.
    ///
    /// When `chain` is empty this swaps the two lists, so the sender's spare capacity
    /// becomes the queue's and neither side allocates.
    pub fn take(&self, chain: &mut VecDeque<Box<Command>>) -> bool {
        let mut state = self.state.lock();
        let was_new = self.new_data.swap(false, Ordering::AcqRel);
        if chain.is_empty() {
            std::mem::swap(&mut state.commands, chain);
        } else {
            chain.append(&mut state.commands);
        }
        was_new
    }

    /// Lock-free peek at the new-data flag.
    pub fn has_new(&self) -> bool {
        self.new_data.load(Ordering::Acquire)
    }

    /// Refuses further pushes and returns whatever was still queued.
    pub fn close(&self) -> VecDeque<Box<Command>> {
        let mut state = self.state.lock();
        state.closed = true;
        self.new_data.store(false, Ordering::Release);
        let commands = std::mem::take(&mut state.commands);
        drop(state);

        self.signal.set();
        commands
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn signal(&self) -> &WaitHandle {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::command::{CommandInfo, CommandFlags, CommandKind};

    use super::*;

    fn command(index: u32) -> Box<Command> {
        let mut command = Box::new(Command::new());
        command.set_request(
            CommandKind::Call,
            CommandInfo::new(0, CommandFlags::NONE),
            index,
            false,
        );
        command
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = CommandQueue::new();
        for index in 0..3 {
            queue.push(command(index)).unwrap();
        }

        let mut chain = VecDeque::new();
        assert!(queue.take(&mut chain));
        let order: Vec<u32> = chain.iter().map(|c| c.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.is_empty());
        assert!(!queue.has_new());
    }

    #[test]
    fn take_appends_after_leftovers() {
        let queue = CommandQueue::new();
        let mut chain = VecDeque::from([command(0)]);
        queue.push(command(1)).unwrap();

        queue.take(&mut chain);
        let order: Vec<u32> = chain.iter().map(|c| c.index()).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn first_push_signals_sender() {
        let queue = CommandQueue::new();
        queue.push(command(0)).unwrap();
        queue.push(command(1)).unwrap();

        assert!(queue.signal().wait(Some(Duration::ZERO)));
        // The second push found the flag already set and did not signal again.
        assert!(!queue.signal().wait(Some(Duration::ZERO)));
    }

    #[test]
    fn closed_queue_rejects_and_drains() {
        let queue = CommandQueue::new();
        queue.push(command(0)).unwrap();

        let leftovers = queue.close();
        assert_eq!(leftovers.len(), 1);
        assert!(queue.is_closed());
        assert!(queue.push(command(1)).is_err());
    }

    #[test]
    fn heartbeat_only_when_idle() {
        let queue = CommandQueue::new();
        assert!(queue.push_if_idle(command(0)).is_ok());
        assert!(queue.push_if_idle(command(1)).is_err());

        queue.take(&mut VecDeque::new());
        assert!(queue.push_if_idle(command(2)).is_ok());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 500;

        let queue = Arc::new(CommandQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for n in 0..PER_PRODUCER {
                        queue.push(command(producer * PER_PRODUCER + n)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut chain = VecDeque::new();
        queue.take(&mut chain);
        let mut seen: Vec<u32> = chain.iter().map(|c| c.index()).collect();
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);

        // Each producer's own commands stay in order.
        for producer in 0..PRODUCERS {
            let range = producer * PER_PRODUCER..(producer + 1) * PER_PRODUCER;
            let own: Vec<u32> = seen.iter().copied().filter(|i| range.contains(i)).collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
    }

    #[test]
    fn wait_times_out_without_signal() {
        let handle = WaitHandle::default();
        handle.register();
        let start = Instant::now();
        assert!(!handle.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn take_swaps_capacity_with_an_empty_chain() {
        let queue = CommandQueue::with_capacity(16);
        let mut chain = VecDeque::with_capacity(32);
        for index in 0..4 {
            queue.push(command(index)).unwrap();
        }

        assert!(queue.take(&mut chain));
        assert_eq!(chain.len(), 4);
        assert!(chain.capacity() >= 16);
        assert!(queue.state.lock().commands.capacity() >= 32);
    }
}
