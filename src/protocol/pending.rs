use parking_lot::Mutex;

use crate::command::Completion;

use super::RawReturn;

/// Largest callback index; response records carry it in a non-negative `i32`.
const MAX_INDEX: usize = i32::MAX as usize;

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<Completion>>,
    free: Vec<u32>,
    outstanding: usize,
    closed: bool,
}

/// Completions of calls that are queued or in flight, keyed by callback index.
///
/// A completion is taken out under the lock and invoked after the lock is dropped, so
/// continuations never run inside the table and each one runs exactly once.
#[derive(Debug, Default)]
pub struct PendingCalls {
    slots: Mutex<Slots>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `completion` and returns its callback index. Hands the completion back
    /// once the table has been closed.
    pub fn register(&self, completion: Completion) -> Result<u32, Completion> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(completion);
        }
        let index = match slots.free.pop() {
            Some(index) => index,
            None if slots.entries.len() <= MAX_INDEX => {
                let Ok(index) = u32::try_from(slots.entries.len()) else {
                    return Err(completion);
                };
                slots.entries.push(None);
                index
            }
            None => return Err(completion),
        };
        if let Some(entry) = slots.entries.get_mut(index as usize) {
            *entry = Some(completion);
        }
        slots.outstanding += 1;
        Ok(index)
    }

    /// Removes and returns the completion stored at `index`.
    pub fn take(&self, index: u32) -> Option<Completion> {
        let mut slots = self.slots.lock();
        let completion = slots.entries.get_mut(index as usize)?.take()?;
        slots.free.push(index);
        slots.outstanding -= 1;
        Some(completion)
    }

    /// Resolves the call at `index`. Returns `false` if no call was waiting there.
    pub fn complete(&self, index: u32, raw: RawReturn) -> bool {
        match self.take(index) {
            Some(completion) => {
                completion.complete(raw);
                true
            }
            None => false,
        }
    }

    /// Refuses new registrations and returns every outstanding completion.
    pub fn close(&self) -> Vec<Completion> {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.outstanding = 0;
        slots.free.clear();
        slots.entries.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::protocol::ReturnType;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> Completion {
        let counter = Arc::clone(counter);
        Completion::Callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn indices_are_recycled() {
        let calls = PendingCalls::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let a = calls.register(counting(&counter)).unwrap();
        let b = calls.register(counting(&counter)).unwrap();
        assert_ne!(a, b);
        assert_eq!(calls.len(), 2);

        assert!(calls.complete(a, ReturnType::Success.into()));
        assert_eq!(calls.register(counting(&counter)).unwrap(), a);
    }

    #[test]
    fn completes_exactly_once() {
        let calls = PendingCalls::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let index = calls.register(counting(&counter)).unwrap();

        assert!(calls.complete(index, ReturnType::Success.into()));
        assert!(!calls.complete(index, ReturnType::Success.into()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_hands_back_everything() {
        let calls = PendingCalls::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            calls.register(counting(&counter)).unwrap();
        }

        let outstanding = calls.close();
        assert_eq!(outstanding.len(), 3);
        assert!(calls.is_empty());
        assert!(calls.register(counting(&counter)).is_err());
    }
}
