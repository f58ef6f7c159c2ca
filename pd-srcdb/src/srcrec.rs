//! Per-location chaining state.
//!
//! Translations for one source location form a fallback chain: the
//! guard-failure exits of each translation are smashed to the entry of the
//! next one added, and the exits of the newest translation stay pointed at
//! a retranslate stub until another translation arrives or production is
//! halted. Branch sites elsewhere in the cache always enter the chain at
//! the first translation of the current epoch, or at the anchor when the
//! location has none.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::addr::CodeAddr;
use crate::branch::{BranchKind, BranchSite};
use crate::srcdb::SrcKey;
use crate::tc::TcServices;
use crate::trans_loc::TransLoc;

#[derive(Debug, Default)]
struct ChainState {
    translations: Vec<TransLoc>,
    incoming: Vec<BranchSite>,
    tail_fallbacks: Vec<BranchSite>,
    epoch: u64,
}

pub struct SrcRec {
    key: SrcKey,
    anchor: CodeAddr,
    // mirror of the top translation for lock-free lookups; 0 means none
    top: AtomicUsize,
    state: Mutex<ChainState>,
    services: Arc<TcServices>,
}

impl SrcRec {
    pub fn new(key: SrcKey, anchor: CodeAddr, services: Arc<TcServices>) -> Self {
        assert!(!anchor.is_null(), "SrcRec({key}) needs a non-null anchor");
        Self {
            key,
            anchor,
            top: AtomicUsize::new(0),
            state: Mutex::new(ChainState::default()),
            services,
        }
    }

    pub fn key(&self) -> SrcKey {
        self.key
    }

    /// The retranslate stub every site falls back to when no translation is
    /// usable.
    pub fn anchor(&self) -> CodeAddr {
        self.anchor
    }

    /// Where a failing guard of the translation being produced should go.
    pub fn fallback_translation(&self) -> CodeAddr {
        self.anchor
    }

    /// Entry of the first translation of the current epoch.
    pub fn top_translation(&self) -> Option<CodeAddr> {
        match self.top.load(Ordering::Acquire) {
            0 => None,
            raw => Some(CodeAddr::new(raw)),
        }
    }

    /// Where a branch into this location should go right now.
    pub fn preferred_target(&self) -> CodeAddr {
        self.top_translation().unwrap_or(self.anchor)
    }

    pub fn translations(&self) -> Vec<TransLoc> {
        self.lock().translations.clone()
    }

    pub fn translation_count(&self) -> usize {
        self.lock().translations.len()
    }

    /// True once the next translation must be the interpreter-only one.
    pub fn at_translation_limit(&self) -> bool {
        self.translation_count() >= self.services.config.translation_limit()
    }

    pub fn external_sites(&self) -> Vec<BranchSite> {
        self.lock().incoming.clone()
    }

    pub fn tail_fallback_sites(&self) -> Vec<BranchSite> {
        self.lock().tail_fallbacks.clone()
    }

    /// Adds a newly discovered branch into this location and smashes it to
    /// the current preferred target.
    ///
    /// The smash itself runs outside the record lock, so a racing
    /// invalidation may briefly leave the site on a translation that was
    /// just retired. A second, locked pass repairs the site if the epoch or
    /// top changed in the meantime. Callers should hold a treadmill request
    /// so the retired code cannot be reused during that window.
    pub fn register_external_site(&self, site: BranchSite) {
        debug_assert!(
            site.kind() == BranchKind::Addr
                || self.services.code.is_valid_code_address(site.to_smash()),
            "branch site {} is outside the code cache",
            site.to_smash()
        );
        let (dest, epoch, count) = {
            let mut state = self.lock();
            state.incoming.push(site);
            (self.preferred_target(), state.epoch, state.incoming.len())
        };
        trace!(
            "SrcRec({})::register_external_site {} -> {} ({:?}); {count} incoming branches",
            self.key,
            site.to_smash(),
            dest,
            site.kind()
        );
        site.patch(dest);

        if self.services.config.reusable_tc {
            self.services.jumps.record_jump(site.to_smash(), self.key);
        }

        let state = self.lock();
        let current = self.preferred_target();
        if (state.epoch != epoch || current != dest) && state.incoming.contains(&site) {
            trace!(
                "SrcRec({}) rechaining raced site {} -> {current}",
                self.key,
                site.to_smash()
            );
            site.patch(current);
        }
    }

    /// Appends a translation and links it into the fallback chain.
    ///
    /// `tail_sites` are the guard-failure exits of `loc`; they are smashed
    /// to whichever translation is added next.
    pub fn add_translation(&self, loc: TransLoc, tail_sites: Vec<BranchSite>) {
        let mut state = self.lock();
        let limit = self.services.config.translation_limit();
        assert!(
            state.translations.len() <= limit,
            "SrcRec({}) already holds {} translations (limit {limit})",
            self.key,
            state.translations.len()
        );

        let entry = loc.entry(&*self.services.code);
        debug!(
            "SrcRec({})::add_translation #{} @{entry}",
            self.key,
            state.translations.len() + 1
        );

        state.translations.push(loc);
        if self.top_translation().is_none() {
            self.top.store(entry.raw(), Ordering::Release);
            self.retarget_external_sites(&state, entry);
        }

        // The previous tail translation's guard failures now fall through
        // into the new translation instead of requesting a retranslate.
        for site in &state.tail_fallbacks {
            site.patch(entry);
        }
        state.tail_fallbacks = tail_sites;
    }

    /// Points the newest translation's guard failures at a non-translation
    /// stub and forgets them, for when no more translations will be made.
    pub fn redirect_fallbacks_to_stub(&self, stub: CodeAddr) {
        assert!(!stub.is_null(), "SrcRec({}) fallback stub is null", self.key);
        let mut state = self.lock();
        debug!(
            "SrcRec({})::redirect_fallbacks_to_stub @{stub} ({} sites)",
            self.key,
            state.tail_fallbacks.len()
        );
        for site in &state.tail_fallbacks {
            site.patch(stub);
        }
        state.tail_fallbacks.clear();
    }

    pub fn remove_external_site(&self, to_smash: CodeAddr) {
        let mut state = self.lock();
        let before = state.incoming.len();
        state.incoming.retain(|site| site.to_smash() != to_smash);
        assert!(
            state.incoming.len() != before,
            "SrcRec({}) has no incoming branch at {to_smash}",
            self.key
        );
    }

    /// Forgets every external site in `[start, frontier)`; returns how many.
    pub fn remove_external_sites_in_range(&self, start: CodeAddr, frontier: CodeAddr) -> usize {
        let mut state = self.lock();
        let before = state.incoming.len();
        state.incoming.retain(|site| {
            let addr = site.to_smash();
            !(start <= addr && addr < frontier)
        });
        before - state.incoming.len()
    }

    /// Drops every translation and sends all incoming branches back to the
    /// anchor. Retired code is reused only after the treadmill drains.
    pub fn invalidate_all(&self) {
        assert!(
            self.services.config.replaceable_translations,
            "SrcRec({}) translations are not replaceable in this configuration",
            self.key
        );
        let retired = {
            let mut state = self.lock();
            let retired = std::mem::take(&mut state.translations);
            state.tail_fallbacks.clear();
            state.epoch += 1;
            self.top.store(0, Ordering::Release);
            debug!(
                "SrcRec({})::invalidate_all retiring {} translation(s)",
                self.key,
                retired.len()
            );
            self.retarget_external_sites(&state, self.anchor);
            retired
        };

        if self.services.config.reusable_tc {
            self.services
                .reclaimer
                .reclaim_translations(self.key, retired);
        }
    }

    fn retarget_external_sites(&self, state: &ChainState, new_top: CodeAddr) {
        trace!(
            "SrcRec({}) rechaining {} incoming branches -> {new_top}",
            self.key,
            state.incoming.len()
        );
        for site in &state.incoming {
            site.patch(new_top);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().expect("srcrec lock poisoned")
    }
}

impl std::fmt::Debug for SrcRec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SrcRec")
            .field("key", &self.key)
            .field("anchor", &self.anchor)
            .field("top", &self.top_translation())
            .field("translations", &state.translations.len())
            .field("incoming", &state.incoming.len())
            .field("tail_fallbacks", &state.tail_fallbacks.len())
            .field("epoch", &state.epoch)
            .finish()
    }
}
