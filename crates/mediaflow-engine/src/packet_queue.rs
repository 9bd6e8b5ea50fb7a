// crates/mediaflow-engine/src/packet_queue.rs
//
// Bounded FIFO of compressed packets between the reader and one decoder.
// One mutex guards all mutable state; one condvar is shared by producer and
// consumer. abort() broadcasts so every waiter (current and future) wakes.
//
// Node shells are recycled through `pool` instead of reallocating a fresh
// PacketNode per packet — an internal micro-optimization, never observable
// outside this module.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use ffmpeg_the_third::Packet;

use mediaflow_types::EngineError;

/// Packet duration is accounted with a floor so that very short/zero-duration
/// packets still cost something against the byte+duration budget.
const MIN_DURATION_UNITS: i64 = 15;
const NODE_POOL_CAP: usize = 64;

struct PacketNode {
    packet: Option<Packet>,
    stream_index: usize,
    duration: i64,
    size: i64,
    serial: u64,
}

impl PacketNode {
    fn null(stream_index: usize) -> Self {
        PacketNode { packet: None, stream_index, duration: 0, size: 0, serial: 0 }
    }
}

pub struct DequeuedPacket {
    pub packet: Option<Packet>,
    pub stream_index: usize,
    pub serial: u64,
}

pub enum GetResult {
    Packet(DequeuedPacket),
    Empty,
}

struct Inner {
    queue: VecDeque<PacketNode>,
    pool: Vec<PacketNode>,
    size_bytes: i64,
    duration: i64,
    serial: u64,
    abort_request: bool,
}

pub struct PacketQueue {
    name: &'static str,
    node_overhead: i64,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl PacketQueue {
    pub fn new(name: &'static str, node_overhead: i64) -> Self {
        PacketQueue {
            name,
            node_overhead,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pool: Vec::new(),
                size_bytes: 0,
                duration: 0,
                serial: 0,
                abort_request: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn take_node(&self, g: &mut Inner, stream_index: usize, packet: Option<Packet>) -> PacketNode {
        let (duration, size) = match &packet {
            Some(p) => (p.duration().max(MIN_DURATION_UNITS), p.size() as i64),
            None => (0, 0),
        };
        if let Some(mut node) = g.pool.pop() {
            node.packet = packet;
            node.stream_index = stream_index;
            node.duration = duration;
            node.size = size;
            node.serial = g.serial;
            node
        } else {
            PacketNode { packet, stream_index, duration, size, serial: g.serial }
        }
    }

    fn recycle(&self, g: &mut Inner, node: PacketNode) {
        if g.pool.len() < NODE_POOL_CAP {
            let mut shell = node;
            shell.packet = None;
            g.pool.push(shell);
        }
    }

    /// Append a packet, stamping it with the queue's current serial. Fails
    /// with `Aborted` if the queue has already been aborted — the caller owns
    /// the packet and must drop it.
    pub fn put(&self, stream_index: usize, packet: Packet) -> Result<(), EngineError> {
        let mut g = self.inner.lock().unwrap();
        if g.abort_request {
            return Err(EngineError::Aborted);
        }
        let node = self.take_node(&mut g, stream_index, Some(packet));
        g.size_bytes += node.size + self.node_overhead;
        g.duration += node.duration;
        g.queue.push_back(node);
        drop(g);
        self.cond.notify_all();
        Ok(())
    }

    /// Enqueue a payload-less sentinel a decoder recognizes as EOF for `stream_index`.
    pub fn put_null(&self, stream_index: usize) -> Result<(), EngineError> {
        let mut g = self.inner.lock().unwrap();
        if g.abort_request {
            return Err(EngineError::Aborted);
        }
        let mut node = PacketNode::null(stream_index);
        node.serial = g.serial;
        g.duration += MIN_DURATION_UNITS;
        g.queue.push_back(node);
        drop(g);
        self.cond.notify_all();
        Ok(())
    }

    fn pop_front(&self, g: &mut Inner) -> DequeuedPacket {
        let mut node = g.queue.pop_front().expect("caller checked non-empty");
        g.size_bytes -= node.size + self.node_overhead;
        g.duration -= node.duration;
        let out = DequeuedPacket {
            packet: node.packet.take(),
            stream_index: node.stream_index,
            serial: node.serial,
        };
        self.recycle(g, node);
        out
    }

    /// Pop from the head. Non-blocking: returns `Empty` immediately. Blocking:
    /// waits on the condvar until a packet arrives or the queue is aborted.
    pub fn get(&self, block: bool) -> Result<GetResult, EngineError> {
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.abort_request {
                return Err(EngineError::Aborted);
            }
            if let Some(_front) = g.queue.front() {
                let out = self.pop_front(&mut g);
                drop(g);
                self.cond.notify_all();
                return Ok(GetResult::Packet(out));
            }
            if !block {
                return Ok(GetResult::Empty);
            }
            g = self.cond.wait(g).unwrap();
        }
    }

    /// Non-blocking get first — so an empty-queue signal can be observed by a
    /// reader waiting on this same condvar — falling back to a blocking get.
    pub fn get_or_buffer(&self) -> Result<DequeuedPacket, EngineError> {
        match self.get(false)? {
            GetResult::Packet(p) => Ok(p),
            GetResult::Empty => match self.get(true)? {
                GetResult::Packet(p) => Ok(p),
                GetResult::Empty => unreachable!("blocking get never returns Empty"),
            },
        }
    }

    /// Sets the abort flag and wakes every waiter, current and future.
    pub fn abort(&self) {
        let mut g = self.inner.lock().unwrap();
        g.abort_request = true;
        drop(g);
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().abort_request
    }

    pub fn size_bytes(&self) -> i64 {
        self.inner.lock().unwrap().size_bytes
    }

    pub fn duration(&self) -> i64 {
        self.inner.lock().unwrap().duration
    }

    pub fn packet_count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn serial(&self) -> u64 {
        self.inner.lock().unwrap().serial
    }

    /// Bump the queue's serial for every newly enqueued packet (a preserved
    /// idiosyncrasy — see the design notes on serial bumps).
    pub fn bump_serial(&self) -> u64 {
        let mut g = self.inner.lock().unwrap();
        g.serial += 1;
        g.serial
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn dummy_packet() -> Packet {
        Packet::copy(&[0u8; 4])
    }

    #[test]
    fn put_then_get_round_trips_stream_index() {
        let q = PacketQueue::new("test", 8);
        q.put(1, dummy_packet()).unwrap();
        match q.get(false).unwrap() {
            GetResult::Packet(p) => assert_eq!(p.stream_index, 1),
            GetResult::Empty => panic!("expected a packet"),
        }
    }

    #[test]
    fn non_blocking_get_on_empty_returns_empty() {
        let q = PacketQueue::new("test", 8);
        match q.get(false).unwrap() {
            GetResult::Empty => {}
            GetResult::Packet(_) => panic!("queue should be empty"),
        }
    }

    #[test]
    fn abort_unblocks_a_blocking_waiter() {
        let q = Arc::new(PacketQueue::new("test", 8));
        let q2 = q.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = barrier.clone();

        let handle = thread::spawn(move || {
            b2.wait();
            matches!(q2.get(true), Err(EngineError::Aborted))
        });

        barrier.wait();
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.abort();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn abort_then_blocking_get_returns_aborted_regardless_of_contents() {
        let q = PacketQueue::new("test", 8);
        q.put(0, dummy_packet()).unwrap();
        q.abort();
        assert!(matches!(q.get(true), Err(EngineError::Aborted)));
    }

    #[test]
    fn budget_accounting_matches_sum_of_members() {
        let q = PacketQueue::new("test", 8);
        q.put(0, dummy_packet()).unwrap();
        q.put(0, dummy_packet()).unwrap();
        let pkt = dummy_packet();
        let expected_size = 2 * (pkt.size() as i64 + 8);
        assert_eq!(q.size_bytes(), expected_size);
        assert_eq!(q.duration(), 2 * MIN_DURATION_UNITS);
    }

    #[test]
    fn put_after_abort_fails_and_leaves_packet_with_caller() {
        let q = PacketQueue::new("test", 8);
        q.abort();
        let res = q.put(0, dummy_packet());
        assert!(matches!(res, Err(EngineError::Aborted)));
    }

    #[test]
    fn get_or_buffer_returns_enqueued_packet() {
        let q = PacketQueue::new("test", 8);
        q.put(2, dummy_packet()).unwrap();
        let out = q.get_or_buffer().unwrap();
        assert_eq!(out.stream_index, 2);
    }
}
