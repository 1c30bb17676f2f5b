use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::{debug, warn};

use crate::circuit::Signal;

/// A probe as seen by the audio thread.
#[derive(Debug)]
pub struct ProbeChannel {
    pub signal: Arc<Signal>,
    pub samples: Vec<f64>,
}

#[derive(Debug)]
struct Entry {
    signal: Arc<Signal>,
    /// Empty once the audio thread has taken it.
    buffer: Vec<f64>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: Vec<Entry>,
    /// Channels dropped by the audio thread, freed on the next edit.
    recycled: Vec<ProbeChannel>,
}

#[derive(Debug)]
pub struct ProbeRegistry {
    state: Mutex<RegistryState>,
    generation: AtomicU64,
    max_probes: usize,
    block_size: usize,
}

impl ProbeRegistry {
    pub fn new(max_probes: usize, block_size: usize) -> Self {
        ProbeRegistry {
            state: Mutex::new(RegistryState {
                entries: Vec::with_capacity(max_probes),
                recycled: Vec::with_capacity(max_probes),
            }),
            generation: AtomicU64::new(0),
            max_probes,
            block_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a probe. Adding a signal that is already present is a no-op.
    ///
    /// Returns true if the probe was added.
    pub fn add(&self, signal: Signal) -> bool {
        let mut state = self.lock();
        state.recycled.clear();
        if state.entries.iter().any(|e| *e.signal == signal) {
            return false;
        }
        if state.entries.len() >= self.max_probes {
            warn!(
                "Probe limit of {} reached, ignoring {}",
                self.max_probes, signal
            );
            return false;
        }
        debug!("Adding probe {}", signal);
        state.entries.push(Entry {
            signal: Arc::new(signal),
            buffer: vec![0.0; self.block_size],
        });
        self.generation.fetch_add(1, Ordering::Release);
        true
    }

    /// Unregister a probe. Removing an absent signal is a no-op.
    pub fn remove(&self, signal: &Signal) -> bool {
        let mut state = self.lock();
        state.recycled.clear();
        let before = state.entries.len();
        state.entries.retain(|e| *e.signal != *signal);
        if state.entries.len() == before {
            return false;
        }
        debug!("Removed probe {}", signal);
        self.generation.fetch_add(1, Ordering::Release);
        true
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.lock()
            .entries
            .iter()
            .map(|e| (*e.signal).clone())
            .collect()
    }

    pub fn contains(&self, signal: &Signal) -> bool {
        self.lock().entries.iter().any(|e| *e.signal == *signal)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bring `channels` in line with the registry without blocking or allocating.
    ///
    /// `channels` must have capacity for `max_probes` entries. `seen` is the
    /// generation the channels reflect; it is only advanced when the sync
    /// actually happened.
    pub fn sync(&self, channels: &mut Vec<ProbeChannel>, seen: &mut u64) {
        let generation = self.generation();
        if generation == *seen {
            return;
        }
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        let state = &mut *state;

        let mut i = 0;
        while i < channels.len() {
            if state.entries.iter().any(|e| *e.signal == *channels[i].signal) {
                i += 1;
            } else if state.recycled.len() < state.recycled.capacity() {
                state.recycled.push(channels.swap_remove(i));
            } else {
                // Recycling is full until the next edit; keep the channel
                // and retry on a later sync.
                return;
            }
        }

        for entry in state.entries.iter_mut() {
            if channels.len() >= channels.capacity() {
                break;
            }
            if entry.buffer.is_empty() || channels.iter().any(|c| *c.signal == *entry.signal) {
                continue;
            }
            channels.push(ProbeChannel {
                signal: Arc::clone(&entry.signal),
                samples: std::mem::take(&mut entry.buffer),
            });
        }

        *seen = self.generation();
    }
}
