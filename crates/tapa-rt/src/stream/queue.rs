// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Queue storage behind a channel.
//!
//! Bounded channels use a ring of `depth + 1` slots indexed by two
//! monotonically increasing counters: the producer writes at `head`, the
//! consumer reads at `tail`. Each counter has exactly one writer, so the only
//! synchronisation is the release/acquire pair on the counters. Slots sit
//! behind their own mutex, which is never contended by a well-behaved
//! single-producer/single-consumer pair. Unbounded channels use a locked
//! deque.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One element of a channel: a value, or the end-of-transmission marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token<T> {
    Value(T),
    Eot,
}

impl<T> Token<T> {
    pub fn is_eot(&self) -> bool {
        matches!(self, Token::Eot)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Token::Value(v) => Some(v),
            Token::Eot => None,
        }
    }
}

pub(crate) struct RingQueue<T> {
    slots: Box<[Mutex<Option<Token<T>>>]>,
    depth: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

impl<T> RingQueue<T> {
    pub fn new(depth: usize) -> Self {
        let slots = (0..=depth).map(|_| Mutex::new(None)).collect();
        Self {
            slots,
            depth: depth as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    fn slot(&self, pos: u64) -> &Mutex<Option<Token<T>>> {
        &self.slots[(pos % self.slots.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_full(&self) -> bool {
        self.len() as u64 >= self.depth
    }

    pub fn push(&self, token: Token<T>) -> Result<(), Token<T>> {
        if self.is_full() {
            return Err(token);
        }
        let head = self.head.load(Ordering::Relaxed);
        *self.slot(head).lock().unwrap() = Some(token);
        self.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<Token<T>> {
        let tail = self.tail.load(Ordering::Relaxed);
        if self.head.load(Ordering::Acquire) == tail {
            return None;
        }
        let token = self.slot(tail).lock().unwrap().take();
        self.tail.store(tail + 1, Ordering::Release);
        token
    }

    pub fn front_with<R>(&self, f: impl FnOnce(&Token<T>) -> R) -> Option<R> {
        let tail = self.tail.load(Ordering::Relaxed);
        if self.head.load(Ordering::Acquire) == tail {
            return None;
        }
        self.slot(tail).lock().unwrap().as_ref().map(f)
    }
}

pub(crate) struct LockedQueue<T> {
    items: Mutex<VecDeque<Token<T>>>,
}

impl<T> LockedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn push(&self, token: Token<T>) {
        self.items.lock().unwrap().push_back(token);
    }

    pub fn pop(&self) -> Option<Token<T>> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn front_with<R>(&self, f: impl FnOnce(&Token<T>) -> R) -> Option<R> {
        self.items.lock().unwrap().front().map(f)
    }
}

pub(crate) enum Queue<T> {
    Ring(RingQueue<T>),
    Locked(LockedQueue<T>),
}

impl<T> Queue<T> {
    pub fn bounded(depth: usize) -> Self {
        Queue::Ring(RingQueue::new(depth))
    }

    pub fn unbounded() -> Self {
        Queue::Locked(LockedQueue::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Queue::Ring(q) => q.len(),
            Queue::Locked(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        match self {
            Queue::Ring(q) => q.is_full(),
            Queue::Locked(_) => false,
        }
    }

    pub fn push(&self, token: Token<T>) -> Result<(), Token<T>> {
        match self {
            Queue::Ring(q) => q.push(token),
            Queue::Locked(q) => {
                q.push(token);
                Ok(())
            }
        }
    }

    pub fn pop(&self) -> Option<Token<T>> {
        match self {
            Queue::Ring(q) => q.pop(),
            Queue::Locked(q) => q.pop(),
        }
    }

    /// Inspect the front element without removing it.
    pub fn front_with<R>(&self, f: impl FnOnce(&Token<T>) -> R) -> Option<R> {
        match self {
            Queue::Ring(q) => q.front_with(f),
            Queue::Locked(q) => q.front_with(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_holds_exactly_depth() {
        let q = RingQueue::new(3);
        for i in 0..3 {
            assert!(q.push(Token::Value(i)).is_ok());
        }
        assert!(q.is_full());
        assert_eq!(q.push(Token::Value(9)), Err(Token::Value(9)));
        assert_eq!(q.pop(), Some(Token::Value(0)));
        assert!(q.push(Token::Value(3)).is_ok());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn ring_wraps_many_times() {
        let q = RingQueue::new(2);
        for i in 0..100 {
            q.push(Token::Value(i)).unwrap();
            assert_eq!(q.front_with(|t| t.clone()), Some(Token::Value(i)));
            assert_eq!(q.pop(), Some(Token::Value(i)));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn locked_queue_never_fills() {
        let q: Queue<u32> = Queue::unbounded();
        for i in 0..10_000 {
            q.push(Token::Value(i)).unwrap();
        }
        assert!(!q.is_full());
        assert_eq!(q.len(), 10_000);
    }

    #[test]
    fn eot_is_an_element() {
        let q: Queue<u8> = Queue::bounded(1);
        q.push(Token::Eot).unwrap();
        assert!(q.is_full());
        assert_eq!(q.front_with(Token::is_eot), Some(true));
        assert_eq!(q.pop(), Some(Token::Eot));
        assert!(q.is_empty());
    }

    #[test]
    fn spsc_across_threads() {
        let q = std::sync::Arc::new(RingQueue::new(4));
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    let mut tok = Token::Value(i);
                    while let Err(back) = q.push(tok) {
                        tok = back;
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut expected = 0;
        while expected < 10_000 {
            if let Some(Token::Value(v)) = q.pop() {
                assert_eq!(v, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
