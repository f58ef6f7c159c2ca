use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace};

use crate::addr::{CodeAddr, CodeRange};
use crate::code_cache::CodeCache;
use crate::config::SrcDbConfig;
use crate::srcrec::SrcRec;
use crate::tc::{JumpRecorder, TcServices};
use crate::treadmill::{Treadmill, TreadmillReclaimer};

/// Identifies one translatable source location. How keys are derived is up
/// to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SrcKey(pub u64);

impl fmt::Display for SrcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sk:{:#x}", self.0)
    }
}

/// Which record owns each recorded branch site, ordered by address so whole
/// code ranges can be looked up at once.
#[derive(Debug, Default)]
pub struct JumpIndex {
    jumps: Mutex<BTreeMap<CodeAddr, SrcKey>>,
}

impl JumpIndex {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owner(&self, to_smash: CodeAddr) -> Option<SrcKey> {
        self.lock().get(&to_smash).copied()
    }

    fn take_range(&self, range: CodeRange) -> Vec<(CodeAddr, SrcKey)> {
        let mut jumps = self.lock();
        let taken: Vec<_> = jumps
            .range(range.start..range.end())
            .map(|(&addr, &owner)| (addr, owner))
            .collect();
        for (addr, _) in &taken {
            jumps.remove(addr);
        }
        taken
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<CodeAddr, SrcKey>> {
        self.jumps.lock().expect("srcdb jump index lock poisoned")
    }
}

impl JumpRecorder for JumpIndex {
    fn record_jump(&self, to_smash: CodeAddr, owner: SrcKey) {
        trace!("recording jump {to_smash} -> SrcRec({owner})");
        self.lock().insert(to_smash, owner);
    }
}

/// State shared between the database and its reclaimer.
#[derive(Default)]
pub(crate) struct SrcDbShared {
    records: RwLock<HashMap<SrcKey, Arc<SrcRec>>>,
    jumps: Arc<JumpIndex>,
}

impl SrcDbShared {
    fn find(&self, key: SrcKey) -> Option<Arc<SrcRec>> {
        self.records
            .read()
            .expect("srcdb records lock poisoned")
            .get(&key)
            .cloned()
    }

    /// Drops every indexed branch site inside `range` from its owner.
    pub(crate) fn unlink_sites_in_range(&self, range: CodeRange) -> usize {
        let doomed = self.jumps.take_range(range);

        let mut owners: Vec<SrcKey> = doomed.iter().map(|&(_, owner)| owner).collect();
        owners.sort_unstable();
        owners.dedup();
        let mut removed = 0;
        for owner in owners {
            if let Some(rec) = self.find(owner) {
                removed += rec.remove_external_sites_in_range(range.start, range.end());
            }
        }
        if !doomed.is_empty() {
            debug!(
                "unlinked {removed} branch site(s) in [{}, {})",
                range.start,
                range.end()
            );
        }
        removed
    }
}

/// Table of source records for one compilation unit plus the index of which
/// record owns each branch site.
pub struct SrcDb {
    shared: Arc<SrcDbShared>,
    services: Arc<TcServices>,
}

impl SrcDb {
    pub fn new(config: SrcDbConfig, cache: Arc<CodeCache>, treadmill: Arc<Treadmill>) -> Self {
        let shared = Arc::new(SrcDbShared::default());
        let reclaimer = TreadmillReclaimer::new(treadmill, Arc::clone(&cache), Arc::downgrade(&shared));
        let services = Arc::new(TcServices {
            config,
            code: cache,
            jumps: Arc::clone(&shared.jumps) as Arc<dyn JumpRecorder>,
            reclaimer: Arc::new(reclaimer),
        });
        Self { shared, services }
    }

    pub fn services(&self) -> &Arc<TcServices> {
        &self.services
    }

    pub fn config(&self) -> &SrcDbConfig {
        &self.services.config
    }

    pub fn find(&self, key: SrcKey) -> Option<Arc<SrcRec>> {
        self.shared.find(key)
    }

    /// Returns the record for `key`, creating it with `anchor` if missing.
    /// An existing record keeps its original anchor.
    pub fn insert(&self, key: SrcKey, anchor: CodeAddr) -> Arc<SrcRec> {
        let mut records = self
            .shared
            .records
            .write()
            .expect("srcdb records lock poisoned");
        Arc::clone(records.entry(key).or_insert_with(|| {
            debug!("creating SrcRec({key}) with anchor {anchor}");
            Arc::new(SrcRec::new(key, anchor, Arc::clone(&self.services)))
        }))
    }

    pub fn len(&self) -> usize {
        self.shared
            .records
            .read()
            .expect("srcdb records lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unlinks every recorded branch site inside `range` from its owning
    /// record, for code that is about to be discarded. Returns the number of
    /// sites removed.
    pub fn unlink_sites_in_range(&self, range: CodeRange) -> usize {
        self.shared.unlink_sites_in_range(range)
    }

    pub fn jump_index(&self) -> &JumpIndex {
        &self.shared.jumps
    }
}

impl fmt::Debug for SrcDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrcDb")
            .field("records", &self.len())
            .field("services", &self.services)
            .finish()
    }
}
