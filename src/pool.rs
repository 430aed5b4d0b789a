//! Bounded reuse pools.
//!
//! The hot path of a connection (queueing a call, building a batch) must not allocate once
//! the connection has warmed up. [`RingPool`] is the generic bounded free-list behind that:
//! `pop` hands back a released instance if one is available, `push` keeps an instance if
//! there is room and otherwise lets it drop. Instances are [`Reset`] on the way in, so
//! nothing from a previous call (payload bytes, completion state) survives into the next.
//!
//! On top of it sit [`CommandPool`], which also caps the number of live commands per
//! connection, and [`BufferPool`], which hands out send buffers of a fixed capacity.
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::queue::ArrayQueue;
use log::trace;

use crate::{command::Command, protocol::TransportError};

/// Clears an instance before it is pooled again.
pub trait Reset {
    fn reset(&mut self);
}

impl<T: Reset> Reset for Box<T> {
    fn reset(&mut self) {
        (**self).reset();
    }
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Generic bounded free-list. No ordering is guaranteed among pooled instances.
pub struct RingPool<T> {
    free: Option<ArrayQueue<T>>,
}

impl<T: Reset> RingPool<T> {
    /// A pool with `capacity` zero never retains anything.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (capacity > 0).then(|| ArrayQueue::new(capacity)),
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.free.as_ref()?.pop()
    }

    /// Returns `item` to the pool. Returns `false` if the pool was full and the item
    /// was dropped instead.
    pub fn push(&self, mut item: T) -> bool {
        let Some(free) = &self.free else {
            return false;
        };
        item.reset();
        free.push(item).is_ok()
    }

    pub fn len(&self) -> usize {
        self.free.as_ref().map_or(0, ArrayQueue::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.free.as_ref().map_or(0, ArrayQueue::capacity)
    }
}

impl<T> fmt::Debug for RingPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingPool")
            .field("len", &self.free.as_ref().map_or(0, ArrayQueue::len))
            .finish()
    }
}

/// Pool of boxed commands that also bounds how many commands are live at once.
#[derive(Debug)]
pub struct CommandPool {
    free: RingPool<Box<Command>>,
    live: AtomicUsize,
    limit: usize,
    max_payload: usize,
}

impl CommandPool {
    /// `max_payload` is the largest payload capacity a pooled command keeps.
    pub fn new(capacity: usize, limit: usize, max_payload: usize) -> Self {
        Self {
            free: RingPool::new(capacity),
            live: AtomicUsize::new(0),
            limit,
            max_payload,
        }
    }

    pub fn acquire(&self) -> Result<Box<Command>, TransportError> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.limit {
                return Err(TransportError::PoolExhausted { limit: self.limit });
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }
        Ok(self.free.pop().unwrap_or_default())
    }

    /// Hands out a command even past the live limit. Used for replies, which answer a
    /// call the peer already issued and so can never be refused.
    pub fn acquire_unbounded(&self) -> Box<Command> {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.free.pop().unwrap_or_default()
    }

    pub fn release(&self, mut command: Box<Command>) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        let capacity = command.payload_mut().capacity();
        if capacity > self.max_payload {
            trace!("shrinking pooled command payload of {capacity} bytes");
            command.reset();
            command.payload_mut().shrink_to(self.max_payload);
        }
        self.free.push(command);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

/// Pool of send buffers with a fixed initial capacity.
#[derive(Debug)]
pub struct BufferPool {
    free: RingPool<Vec<u8>>,
    size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, size: usize) -> Self {
        Self {
            free: RingPool::new(capacity),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.size))
    }

    /// Keeps `buffer` only if it still has the pool's regular size; grown buffers go
    /// back to the allocator.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.capacity() >= self.size && buffer.capacity() <= self.size * 2 {
            self.free.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{CommandInfo, CommandFlags, CommandKind};

    use super::*;

    #[test]
    fn ring_pool_is_bounded() {
        let pool: RingPool<Vec<u8>> = RingPool::new(2);
        assert!(pool.pop().is_none());

        assert!(pool.push(vec![1]));
        assert!(pool.push(vec![2]));
        assert!(!pool.push(vec![3]));
        assert_eq!(pool.len(), 2);

        assert!(pool.pop().unwrap().is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn zero_capacity_pool_retains_nothing() {
        let pool: RingPool<Vec<u8>> = RingPool::new(0);
        assert!(!pool.push(Vec::new()));
        assert!(pool.pop().is_none());
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn reused_command_has_no_residue() {
        let pool = CommandPool::new(4, 4, 1024);
        let mut command = pool.acquire().unwrap();
        command.set_request(
            CommandKind::InputOutput,
            CommandInfo::new(1, CommandFlags::NONE),
            12,
            true,
        );
        command.payload_mut().extend_from_slice(b"previous call");
        pool.release(command);
        assert_eq!(pool.pooled(), 1);

        let command = pool.acquire().unwrap();
        assert_eq!(command.kind(), CommandKind::CallOnly);
        assert!(command.payload().is_empty());
        assert!(!command.has_callback());
    }

    #[test]
    fn command_pool_limits_live_commands() {
        let pool = CommandPool::new(1, 2, 64);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        assert!(matches!(
            pool.acquire(),
            Err(TransportError::PoolExhausted { limit: 2 })
        ));

        pool.release(a);
        assert_eq!(pool.live(), 1);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn unbounded_acquire_ignores_the_limit() {
        let pool = CommandPool::new(1, 1, 64);
        let held = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());

        let reply = pool.acquire_unbounded();
        assert_eq!(pool.live(), 2);

        pool.release(reply);
        pool.release(held);
        assert_eq!(pool.live(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn buffer_pool_drops_grown_buffers() {
        let pool = BufferPool::new(4, 16);
        let buffer = pool.acquire();
        assert!(buffer.capacity() >= 16);
        pool.release(buffer);
        assert_eq!(pool.pooled(), 1);

        pool.release(Vec::with_capacity(1024));
        assert_eq!(pool.pooled(), 1);
    }
}
