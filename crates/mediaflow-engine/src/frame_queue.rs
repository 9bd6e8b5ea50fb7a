// crates/mediaflow-engine/src/frame_queue.rs
//
// Fixed-capacity ring of decoded frames between a decoder and its single
// reader (the audio pull endpoint for the audio queue, the presentation
// scheduler for the video queue). Slots are allocated once and reused in
// place; only the producer touches `windex`, only the reader calls
// next/peek_last/peek_next.
//
// Abort is observed through a non-owning reference to the upstream
// PacketQueue: the engine guarantees the packet queue outlives this queue.

use std::sync::{Arc, Condvar, Mutex};

use crate::packet_queue::PacketQueue;

pub struct Frame<T> {
    pub pts: f64,
    pub duration: f64,
    pub serial: u64,
    pub left_offset: usize,
    pub right_offset: usize,
    pub content: T,
}

impl<T: Default> Frame<T> {
    fn empty() -> Self {
        Frame { pts: f64::NAN, duration: 0.0, serial: 0, left_offset: 0, right_offset: 0, content: T::default() }
    }
}

struct Inner<T> {
    slots: Vec<Frame<T>>,
    rindex: usize,
    windex: usize,
    size: usize,
}

pub struct FrameQueue<T> {
    capacity: usize,
    upstream: Arc<PacketQueue>,
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Default> FrameQueue<T> {
    pub fn new(capacity: usize, upstream: Arc<PacketQueue>) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Frame::empty);
        FrameQueue {
            capacity,
            upstream,
            inner: Mutex::new(Inner { slots, rindex: 0, windex: 0, size: 0 }),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nb_remaining(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Blocks while full and the upstream queue is not aborted. Returns the
    /// writable slot index at `windex`, with its cursor pair reset to zero.
    /// Returns `None` if the upstream queue was aborted while waiting.
    pub fn peek_writable(&self) -> Option<usize> {
        let mut g = self.inner.lock().unwrap();
        while g.size >= self.capacity && !self.upstream.is_aborted() {
            g = self.cond.wait(g).unwrap();
        }
        if self.upstream.is_aborted() {
            return None;
        }
        let windex = g.windex;
        g.slots[windex].left_offset = 0;
        g.slots[windex].right_offset = 0;
        Some(windex)
    }

    /// Mutates the slot previously returned by `peek_writable` through the closure.
    pub fn with_writable<R>(&self, index: usize, f: impl FnOnce(&mut Frame<T>) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        f(&mut g.slots[index])
    }

    /// Advances `windex`, increments `size`, signals.
    pub fn push(&self) {
        let mut g = self.inner.lock().unwrap();
        g.windex = (g.windex + 1) % self.capacity;
        g.size += 1;
        drop(g);
        self.cond.notify_all();
    }

    /// Blocks while empty if `block`; otherwise returns `None` immediately.
    /// Aborted upstream yields `None`.
    pub fn peek_readable(&self, block: bool) -> Option<usize> {
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.size > 0 {
                return Some(g.rindex);
            }
            if self.upstream.is_aborted() || !block {
                return None;
            }
            g = self.cond.wait(g).unwrap();
        }
    }

    pub fn with_readable<R>(&self, index: usize, f: impl FnOnce(&Frame<T>) -> R) -> R {
        let g = self.inner.lock().unwrap();
        f(&g.slots[index])
    }

    pub fn with_readable_mut<R>(&self, index: usize, f: impl FnOnce(&mut Frame<T>) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        f(&mut g.slots[index])
    }

    /// Read-only view of the last-displayed frame (at `rindex`). Used only by
    /// the scheduler.
    pub fn peek_last_index(&self) -> usize {
        self.inner.lock().unwrap().rindex
    }

    /// The slot at `rindex` — same as `peek_last_index` but named for the
    /// scheduler's "currently-up" view.
    pub fn peek_index(&self) -> usize {
        self.inner.lock().unwrap().rindex
    }

    /// The slot one past `rindex`, valid only when `nb_remaining() > 1`.
    pub fn peek_next_index(&self) -> usize {
        let g = self.inner.lock().unwrap();
        (g.rindex + 1) % self.capacity
    }

    /// Releases the frame at `rindex`: drops its decoded content back to
    /// default, advances `rindex`, decrements `size`, signals.
    pub fn next(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.size == 0 {
            return;
        }
        let rindex = g.rindex;
        g.slots[rindex].content = T::default();
        g.rindex = (rindex + 1) % self.capacity;
        g.size -= 1;
        drop(g);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn upstream() -> Arc<PacketQueue> {
        Arc::new(PacketQueue::new("test", 8))
    }

    #[test]
    fn full_queue_blocks_producer_until_next() {
        let fq: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new(2, upstream()));
        for _ in 0..2 {
            let idx = fq.peek_writable().unwrap();
            fq.with_writable(idx, |f| f.content = 7);
            fq.push();
        }
        assert_eq!(fq.nb_remaining(), 2);

        let fq2 = fq.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = barrier.clone();
        let handle = thread::spawn(move || {
            b2.wait();
            // blocks until the main thread calls next()
            fq2.peek_writable().is_some()
        });

        barrier.wait();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fq.next();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn peek_writable_resets_cursor_pair() {
        let fq: FrameQueue<u32> = FrameQueue::new(3, upstream());
        let idx = fq.peek_writable().unwrap();
        fq.with_writable(idx, |f| {
            f.left_offset = 5;
            f.right_offset = 5;
        });
        fq.push();
        fq.next();
        let idx2 = fq.peek_writable().unwrap();
        fq.with_writable(idx2, |f| {
            assert_eq!(f.left_offset, 0);
            assert_eq!(f.right_offset, 0);
        });
    }

    #[test]
    fn peek_readable_non_blocking_on_empty_returns_none() {
        let fq: FrameQueue<u32> = FrameQueue::new(3, upstream());
        assert!(fq.peek_readable(false).is_none());
    }

    #[test]
    fn aborted_upstream_unblocks_peek_readable() {
        let upstream = upstream();
        let fq = Arc::new(FrameQueue::<u32>::new(3, upstream.clone()));
        let fq2 = fq.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = barrier.clone();
        let handle = thread::spawn(move || {
            b2.wait();
            fq2.peek_readable(true)
        });
        barrier.wait();
        std::thread::sleep(std::time::Duration::from_millis(20));
        upstream.abort();
        fq.push(); // wake the condvar, the abort flag does the rest
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn size_stays_within_capacity_bounds() {
        let fq: FrameQueue<u32> = FrameQueue::new(3, upstream());
        assert_eq!(fq.nb_remaining(), 0);
        for _ in 0..3 {
            let idx = fq.peek_writable().unwrap();
            fq.with_writable(idx, |f| f.content = 1);
            fq.push();
        }
        assert_eq!(fq.nb_remaining(), 3);
        fq.next();
        assert_eq!(fq.nb_remaining(), 2);
    }
}
