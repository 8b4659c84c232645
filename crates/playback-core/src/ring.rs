//! Lock-free single-producer/single-consumer sample ring.
//!
//! The ring is the only path audio takes from the decode thread into the real-time
//! callback:
//! - the worker owns the [`RingProducer`] and writes normalized samples
//! - the output callback owns the [`RingConsumer`] and never blocks or allocates
//! - any thread holding a [`RingHandle`] may [`RingHandle::reset`] the ring (seek/stop)
//!
//! Cursors are monotonic sample counters; slots are `AtomicU32` holding `f32` bits.
//! A reset raises a `floor` cursor to the current write cursor, which discards every
//! buffered sample without touching the consumer's cursor. A generation counter is
//! odd while a reset is in progress, so a read or write overlapping a reset can detect
//! it and discard its work.
//!
//! A producer waiting for space parks its thread; the consumer unparks it after freeing
//! space, and only when the waiting flag is set.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

struct Shared {
    cells: Box<[AtomicU32]>,
    capacity: usize,
    frame: usize,
    /// Total samples committed by the producer.
    head: AtomicU64,
    /// Total samples consumed by the consumer.
    tail: AtomicU64,
    /// Everything below this cursor has been discarded by a reset.
    floor: AtomicU64,
    generation: AtomicU64,
    /// Thread that first waited in [`RingProducer::write_timeout`].
    waiter: OnceLock<Thread>,
    waiting: AtomicBool,
}

impl Shared {
    fn read_cursor(&self) -> u64 {
        self.tail.load(Ordering::Acquire).max(self.floor.load(Ordering::SeqCst))
    }

    fn available_to_read(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(self.read_cursor()) as usize
    }

    fn available_to_write(&self) -> usize {
        self.capacity - self.available_to_read().min(self.capacity)
    }

    fn slot(&self, cursor: u64) -> &AtomicU32 {
        &self.cells[(cursor % self.capacity as u64) as usize]
    }

    fn wake_producer(&self) {
        if self.waiting.load(Ordering::SeqCst) {
            if let Some(thread) = self.waiter.get() {
                thread.unpark();
            }
        }
    }
}

/// Constructor namespace for the ring halves.
pub struct RingBuffer;

impl RingBuffer {
    /// Ring of `capacity` samples with single-sample granularity.
    pub fn with_capacity(capacity: usize) -> (RingProducer, RingConsumer) {
        Self::with_frames(capacity, 1)
    }

    /// Ring of `frames` interleaved frames of `channels` samples.
    ///
    /// Reads and writes are rounded down to whole frames.
    pub fn with_frames(frames: usize, channels: usize) -> (RingProducer, RingConsumer) {
        let frame = channels.max(1);
        let capacity = frames.max(1) * frame;
        let cells = (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(Shared {
            cells,
            capacity,
            frame,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            waiter: OnceLock::new(),
            waiting: AtomicBool::new(false),
        });
        (
            RingProducer {
                shared: shared.clone(),
            },
            RingConsumer { shared },
        )
    }
}

/// Result of a bounded blocking write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every sample was committed.
    Complete,
    /// The deadline passed; only `written` samples were committed.
    TimedOut { written: usize },
}

/// Writing half, owned by the decode thread.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Commit as many whole frames from `samples` as fit; returns samples written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let s = &*self.shared;
        let generation = s.generation.load(Ordering::SeqCst);
        if generation & 1 == 1 {
            return 0;
        }

        let head = s.head.load(Ordering::Relaxed);
        let used = head.saturating_sub(s.read_cursor()) as usize;
        let free = s.capacity.saturating_sub(used);
        let n = free.min(samples.len()) / s.frame * s.frame;
        if n == 0 {
            return 0;
        }

        for (i, sample) in samples[..n].iter().enumerate() {
            s.slot(head + i as u64)
                .store(sample.to_bits(), Ordering::Relaxed);
        }
        s.head.store(head + n as u64, Ordering::Release);

        if s.generation.load(Ordering::SeqCst) != generation {
            // A reset overlapped this write; never let it become readable.
            s.floor.fetch_max(head + n as u64, Ordering::SeqCst);
        }
        n
    }

    /// Write all of `samples`, waiting for space until `timeout` elapses.
    ///
    /// The calling thread parks while the ring is full and is unparked by the consumer.
    pub fn write_timeout(&mut self, samples: &[f32], timeout: Duration) -> WriteOutcome {
        let deadline = Instant::now() + timeout;
        let whole = samples.len() / self.shared.frame * self.shared.frame;
        let mut written = 0;
        loop {
            written += self.write(&samples[written..whole]);
            if written >= whole {
                return WriteOutcome::Complete;
            }
            let now = Instant::now();
            if now >= deadline {
                return WriteOutcome::TimedOut { written };
            }
            self.wait_for_space(deadline - now);
        }
    }

    fn wait_for_space(&self, timeout: Duration) {
        let s = &*self.shared;
        let current = thread::current();
        let waiter = s.waiter.get_or_init(|| current.clone());
        if waiter.id() != current.id() {
            // Producer moved threads; the consumer cannot wake this one.
            thread::sleep(timeout.min(Duration::from_millis(1)));
            return;
        }
        s.waiting.store(true, Ordering::SeqCst);
        if s.available_to_write() < s.frame {
            thread::park_timeout(timeout);
        }
        s.waiting.store(false, Ordering::SeqCst);
    }

    pub fn available_to_write(&self) -> usize {
        self.shared.available_to_write()
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn handle(&self) -> RingHandle {
        RingHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Reading half, owned by the output callback.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Copy up to `out.len()` samples (whole frames) into `out`; returns samples read.
    ///
    /// Never blocks or allocates. A read that overlaps a reset returns 0 and consumes
    /// nothing.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let s = &*self.shared;
        let generation = s.generation.load(Ordering::SeqCst);
        if generation & 1 == 1 {
            return 0;
        }

        let start = s.read_cursor();
        let head = s.head.load(Ordering::Acquire);
        let available = head.saturating_sub(start) as usize;
        let n = available.min(out.len()) / s.frame * s.frame;
        if n == 0 {
            return 0;
        }

        for (i, dst) in out[..n].iter_mut().enumerate() {
            *dst = f32::from_bits(s.slot(start + i as u64).load(Ordering::Relaxed));
        }

        fence(Ordering::SeqCst);
        if s.generation.load(Ordering::SeqCst) != generation {
            return 0;
        }
        s.tail.store(start + n as u64, Ordering::Release);
        s.wake_producer();
        n
    }

    /// Reset counter; changes whenever the ring is reset.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn handle(&self) -> RingHandle {
        RingHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Cloneable control handle: reset and occupancy queries.
#[derive(Clone)]
pub struct RingHandle {
    shared: Arc<Shared>,
}

impl RingHandle {
    /// Discard all buffered samples.
    ///
    /// Safe to call while the producer or consumer is mid-operation; whichever of them
    /// overlaps the reset has its work discarded.
    pub fn reset(&self) {
        let s = &*self.shared;
        s.generation.fetch_add(1, Ordering::SeqCst);
        s.floor
            .fetch_max(s.head.load(Ordering::SeqCst), Ordering::SeqCst);
        s.generation.fetch_add(1, Ordering::SeqCst);
        s.wake_producer();
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn available_to_write(&self) -> usize {
        self.shared.available_to_write()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.shared.frame
    }
}
