//! Quiescence-based reclamation of retired code.
//!
//! Reclaiming is split into two phases. Callers first *retire* a resource
//! by unlinking it from every live reference, then `enqueue` the work that
//! actually reuses it. The treadmill stamps that work with a fresh
//! generation and runs it only after every request that started before the
//! stamp has finished, since only those requests could still be executing
//! inside the retired code.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::code_cache::CodeCache;
use crate::srcdb::{SrcDbShared, SrcKey};
use crate::tc::TranslationReclaimer;
use crate::trans_loc::TransLoc;

type Work = Box<dyn FnOnce() + Send>;

struct PendingWork {
    retired_at: u64,
    work: Work,
}

#[derive(Default)]
struct TreadmillState {
    generation: u64,
    next_request: u64,
    // request id -> generation observed when it started
    inflight: BTreeMap<u64, u64>,
    pending: VecDeque<PendingWork>,
}

#[derive(Default)]
pub struct Treadmill {
    state: Mutex<TreadmillState>,
}

impl Treadmill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the calling thread as possibly executing translated code until
    /// the returned guard is dropped.
    pub fn start_request(&self) -> RequestGuard<'_> {
        let mut state = self.lock();
        let id = state.next_request;
        state.next_request += 1;
        let generation = state.generation;
        state.inflight.insert(id, generation);
        RequestGuard {
            treadmill: self,
            id,
        }
    }

    /// Defers `work` until every request in flight right now has finished.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        state.generation += 1;
        let retired_at = state.generation;
        state.pending.push_back(PendingWork {
            retired_at,
            work: Box::new(work),
        });
    }

    /// Runs every deferred item that no in-flight request can still observe
    /// and returns how many ran.
    pub fn check(&self) -> usize {
        let ready = {
            let mut state = self.lock();
            let oldest = state.inflight.values().min().copied();
            let mut ready = Vec::new();
            while let Some(front) = state.pending.front() {
                if oldest.is_some_and(|oldest| oldest < front.retired_at) {
                    break;
                }
                if let Some(item) = state.pending.pop_front() {
                    ready.push(item.work);
                }
            }
            ready
        };
        let count = ready.len();
        for work in ready {
            work();
        }
        if count > 0 {
            debug!("treadmill reclaimed {count} retired item(s)");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn inflight_requests(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn oldest_request_generation(&self) -> Option<u64> {
        self.lock().inflight.values().min().copied()
    }

    fn finish_request(&self, id: u64) {
        self.lock().inflight.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreadmillState> {
        self.state.lock().expect("treadmill lock poisoned")
    }
}

impl std::fmt::Debug for Treadmill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Treadmill")
            .field("generation", &state.generation)
            .field("inflight", &state.inflight.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// An execution that may be running inside translated code.
pub struct RequestGuard<'a> {
    treadmill: &'a Treadmill,
    id: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.treadmill.finish_request(self.id);
        self.treadmill.check();
    }
}

/// Hands retired translations to the treadmill. Once quiescent, branch
/// sites located inside their code are unlinked from the records that own
/// them and the space goes back to the code cache.
pub struct TreadmillReclaimer {
    treadmill: Arc<Treadmill>,
    cache: Arc<CodeCache>,
    db: Weak<SrcDbShared>,
}

impl TreadmillReclaimer {
    pub(crate) fn new(treadmill: Arc<Treadmill>, cache: Arc<CodeCache>, db: Weak<SrcDbShared>) -> Self {
        Self {
            treadmill,
            cache,
            db,
        }
    }
}

impl TranslationReclaimer for TreadmillReclaimer {
    fn reclaim_translations(&self, owner: SrcKey, translations: Vec<TransLoc>) {
        if translations.is_empty() {
            return;
        }
        debug!(
            "SrcRec({owner}) retiring {} translation(s) to the treadmill",
            translations.len()
        );
        let cache = Arc::clone(&self.cache);
        let db = self.db.clone();
        self.treadmill.enqueue(move || {
            for loc in &translations {
                for (_, range) in loc.ranges(&*cache) {
                    if let Some(db) = db.upgrade() {
                        db.unlink_sites_in_range(range);
                    }
                    cache.free(range);
                }
            }
            debug!(
                "SrcRec({owner}) reclaimed code of {} translation(s)",
                translations.len()
            );
        });
    }
}
