//! Sample FIFO between the network tick and the downstream DSP.
//!
//! Ring-buffer SPSC pair. The writer end is shared between the tick
//! thread and the FLAC decoder thread (only one of them produces at a
//! time, depending on the negotiated transport), so it carries a light
//! mutex; the consumer side stays lock-free for the DSP.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

/// Default capacity in IQ pairs. Sized once, large, to avoid resizing
/// when the channel rate changes.
pub const DEFAULT_FIFO_PAIRS: usize = 5_000_000;

#[derive(Clone)]
pub struct SampleWriter {
    prod: Arc<Mutex<HeapProd<i32>>>,
    capacity: usize,
}

pub struct SampleReader {
    cons: HeapCons<i32>,
    capacity: usize,
}

/// Create a FIFO sized for `pairs` IQ pairs.
pub fn sample_fifo(pairs: usize) -> (SampleWriter, SampleReader) {
    let capacity = pairs * 2;
    let rb = HeapRb::<i32>::new(capacity);
    let (prod, cons) = rb.split();
    (
        SampleWriter {
            prod: Arc::new(Mutex::new(prod)),
            capacity,
        },
        SampleReader { cons, capacity },
    )
}

impl SampleWriter {
    /// Push interleaved components; extra samples beyond the free space
    /// are dropped (the jitter discipline upstream keeps this rare).
    pub fn push(&self, samples: &[i32]) -> usize {
        self.prod.lock().push_slice(samples)
    }

    /// Free space in components.
    pub fn vacant(&self) -> usize {
        self.prod.lock().vacant_len()
    }

    pub fn fill(&self) -> usize {
        self.prod.lock().occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl SampleReader {
    /// Pop up to `out.len()` components; returns the number written.
    pub fn read(&mut self, out: &mut [i32]) -> usize {
        self.cons.pop_slice(out)
    }

    pub fn fill(&self) -> usize {
        self.cons.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
