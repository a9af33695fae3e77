use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use crate::core::error::{ErrorKind, Result};
use crate::core::types::ResourcePath;
use crate::query::context::QueryContext;
use crate::query::engine::{CompiledProgram, Sequence};
use crate::query::source::QueryFingerprint;

/// A compiled program bound to its own context.
///
/// Owned by the pool while idle and by exactly one request while borrowed.
#[derive(Debug)]
pub struct CompiledQuery {
    fingerprint: QueryFingerprint,
    program: Box<dyn CompiledProgram>,
    pub context: QueryContext,
}

impl CompiledQuery {
    pub fn new(fingerprint: QueryFingerprint, program: Box<dyn CompiledProgram>, context: QueryContext) -> Self {
        CompiledQuery { fingerprint, program, context }
    }

    pub fn fingerprint(&self) -> &QueryFingerprint {
        &self.fingerprint
    }

    pub fn execute(&mut self) -> Result<Sequence> {
        self.program.execute(&mut self.context)
    }
}

/// Result of [`QueryPool::borrow`].
#[derive(Debug)]
pub struct Borrowed {
    pub query: CompiledQuery,
    /// True when an idle instance was reused.
    pub cached: bool,
}

/// Pool of idle compiled queries keyed by source fingerprint.
///
/// Concurrent requests for the same source each get their own instance; the
/// pool keeps up to `max_per_source` of them idle for later reuse.
pub struct QueryPool {
    idle: Mutex<LruCache<QueryFingerprint, Vec<CompiledQuery>>>,
    max_sources: usize,
    max_per_source: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
    compile_failures: AtomicUsize,
    discarded: AtomicUsize,
}

impl QueryPool {
    pub fn new(max_sources: usize, max_per_source: usize) -> Self {
        let cap = NonZeroUsize::new(max_sources).unwrap_or(NonZeroUsize::MIN);
        QueryPool {
            idle: Mutex::new(LruCache::new(cap)),
            max_sources: cap.get(),
            max_per_source: max_per_source.max(1),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
            compile_failures: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// Takes an idle instance for `fingerprint`, or compiles one with `compile`.
    ///
    /// A reused instance has its context cleared before it is handed out.
    /// Compilation runs without holding the pool lock.
    pub fn borrow<F>(&self, fingerprint: &QueryFingerprint, compile: F) -> Result<Borrowed>
    where
        F: FnOnce() -> Result<CompiledQuery>,
    {
        let idle = self.idle.lock().get_mut(fingerprint).and_then(Vec::pop);
        if let Some(mut query) = idle {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            query.context.prepare_for_reuse();
            trace!(?fingerprint, "compiled query reused");
            return Ok(Borrowed { query, cached: true });
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        match compile() {
            Ok(query) => Ok(Borrowed { query, cached: false }),
            Err(err) => {
                if err.kind == ErrorKind::CompileFailure {
                    self.compile_failures.fetch_add(1, Ordering::Relaxed);
                }
                debug!(?fingerprint, error = %err, "query compilation failed");
                Err(err)
            }
        }
    }

    /// Puts an instance back after a successful execution.
    pub fn return_instance(&self, query: CompiledQuery) {
        let mut idle = self.idle.lock();
        let instances = idle.get_or_insert_mut(query.fingerprint.clone(), Vec::new);
        if instances.len() < self.max_per_source {
            instances.push(query);
        } else {
            trace!(fingerprint = ?query.fingerprint, "idle limit reached, instance dropped");
        }
    }

    /// Drops an instance whose context may be inconsistent after a failure.
    pub fn discard(&self, query: CompiledQuery) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = ?query.fingerprint, "compiled query discarded");
    }

    /// Forgets every idle instance compiled from a stored query at or below `path`.
    pub fn invalidate(&self, path: &ResourcePath) {
        let mut idle = self.idle.lock();
        let stale: Vec<QueryFingerprint> = idle
            .iter()
            .filter(|(fingerprint, _)| fingerprint.path().is_some_and(|p| p.is_descendant_or_self(path)))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in stale {
            idle.pop(&fingerprint);
            debug!(%path, ?fingerprint, "compiled query invalidated");
        }
    }

    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock();
        PoolStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            sources: idle.len(),
            idle_instances: idle.iter().map(|(_, v)| v.len()).sum(),
            capacity: self.max_sources,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub compile_failures: usize,
    pub discarded: usize,
    pub sources: usize,
    pub idle_instances: usize,
    pub capacity: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
