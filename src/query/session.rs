use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use crate::core::error::Result;
use crate::query::engine::Sequence;

/// Handle of a cached result: slot index in the low 32 bits, slot generation above.
///
/// The first id handed out for a slot equals the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn new(index: usize, generation: u32) -> Self {
        SessionId(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        SessionId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn index(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    query: String,
    result: Sequence,
    created: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<CachedResult>,
}

impl Slot {
    fn clear(&mut self) {
        self.entry = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub slots: usize,
    pub occupied: usize,
}

/// Cross-request cache of query results, addressed by [`SessionId`].
///
/// Each slot has its own lock, so lookups, releases and the sweep never wait on
/// one another except for the slot they touch. `add` calls are serialized.
pub struct ResultSessionCache {
    slots: RwLock<Vec<Arc<Mutex<Slot>>>>,
    add_lock: Mutex<()>,
    timeout: Duration,
}

impl ResultSessionCache {
    pub fn new(initial_slots: usize, timeout: Duration) -> Self {
        let slots = (0..initial_slots.max(1)).map(|_| Arc::new(Mutex::new(Slot::default()))).collect();
        ResultSessionCache {
            slots: RwLock::new(slots),
            add_lock: Mutex::new(()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn add(&self, query: &str, result: Sequence) -> SessionId {
        self.add_at(query, result, Instant::now())
    }

    /// Stores a result created at `created` in the first free slot, growing by half when full.
    pub fn add_at(&self, query: &str, result: Sequence, created: Instant) -> SessionId {
        let _adding = self.add_lock.lock();
        let entry = CachedResult { query: query.to_string(), result, created };

        {
            let slots = self.slots.read();
            for (index, slot) in slots.iter().enumerate() {
                let mut slot = slot.lock();
                if slot.entry.is_none() {
                    slot.entry = Some(entry);
                    let id = SessionId::new(index, slot.generation);
                    debug!(session = %id, "result cached");
                    return id;
                }
            }
        }

        let mut slots = self.slots.write();
        let index = slots.len();
        let grown = (index * 3 / 2).max(index + 1);
        slots.resize_with(grown, || Arc::new(Mutex::new(Slot::default())));
        let mut slot = slots[index].lock();
        slot.entry = Some(entry);
        let id = SessionId::new(index, slot.generation);
        debug!(session = %id, slots = grown, "session cache grown");
        id
    }

    /// The cached result, only if `query` is exactly the text it was stored under.
    pub fn get(&self, query: &str, id: SessionId) -> Option<Sequence> {
        let slot = self.slot(id)?;
        let slot = slot.lock();
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry
            .as_ref()
            .filter(|entry| entry.query == query)
            .map(|entry| entry.result.clone())
    }

    /// Frees the slot. Unknown or stale ids are ignored.
    pub fn release(&self, id: SessionId) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let mut slot = slot.lock();
        if slot.generation == id.generation() && slot.entry.is_some() {
            slot.clear();
            debug!(session = %id, "session released");
        }
    }

    /// Clears every slot older than the timeout at `now`. Returns how many were reclaimed.
    pub fn sweep(&self, now: Instant) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().clone();
        let mut reclaimed = 0;
        for (index, slot) in slots.iter().enumerate() {
            let mut slot = slot.lock();
            let expired = slot
                .entry
                .as_ref()
                .is_some_and(|entry| now.saturating_duration_since(entry.created) > self.timeout);
            if expired {
                slot.clear();
                reclaimed += 1;
                info!(slot = index, "session timed out, slot reclaimed");
            }
        }
        reclaimed
    }

    pub fn stats(&self) -> SessionStats {
        let slots = self.slots.read();
        SessionStats {
            slots: slots.len(),
            occupied: slots.iter().filter(|slot| slot.lock().entry.is_some()).count(),
        }
    }

    fn slot(&self, id: SessionId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().get(id.index()).cloned()
    }
}

/// Background thread running [`ResultSessionCache::sweep`] at a fixed period.
///
/// Stops and joins when dropped.
pub struct SessionSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    pub fn spawn(cache: Arc<ResultSessionCache>, period: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let ticker = tick(period);
        let handle = thread::Builder::new()
            .name("session-sweeper".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        cache.sweep(Instant::now());
                    }
                    recv(stopped) -> _ => break,
                }
            })?;
        info!(period_ms = period.as_millis() as u64, "session sweeper started");

        Ok(SessionSweeper { stop: Some(stop), handle: Some(handle) })
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
