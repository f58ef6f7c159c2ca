#![allow(dead_code, unused_imports)]

use std::sync::{Arc, Once};

pub use srcdb::{
    BranchKind, BranchSite, CodeAddr, CodeArea, CodeCache, CodeCacheConfig, CodeMap, CodeRange,
    ConditionCode, SrcDb, SrcDbConfig, SrcKey, SrcRec, TransLoc, Treadmill,
    emit_smashable_addr, emit_smashable_jcc, emit_smashable_jmp,
};

static TRACING: Once = Once::new();

/// Installs a test subscriber; set `RUST_LOG=srcdb=trace` to see chaining.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn test_cache() -> Arc<CodeCache> {
    Arc::new(
        CodeCache::new(CodeCacheConfig {
            main_size: 1 << 16,
            cold_size: 1 << 14,
            frozen_size: 1 << 14,
            executable: false,
        })
        .expect("code cache should map"),
    )
}

pub struct Harness {
    pub cache: Arc<CodeCache>,
    pub treadmill: Arc<Treadmill>,
    pub db: SrcDb,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SrcDbConfig::default())
    }

    pub fn with_config(config: SrcDbConfig) -> Self {
        init_tracing();
        let cache = test_cache();
        let treadmill = Arc::new(Treadmill::new());
        let db = SrcDb::new(config, Arc::clone(&cache), Arc::clone(&treadmill));
        Self {
            cache,
            treadmill,
            db,
        }
    }

    /// A retranslate-style stub in frozen code.
    pub fn stub(&self) -> CodeAddr {
        self.cache
            .emit(CodeArea::Frozen, &[0xCC; 16])
            .expect("emit stub")
            .start
    }

    pub fn record(&self, key: u64) -> Arc<SrcRec> {
        let anchor = self.stub();
        self.db.insert(SrcKey(key), anchor)
    }

    /// A translation body of `len` bytes in main code.
    pub fn translation(&self, len: usize) -> TransLoc {
        let main = self
            .cache
            .emit(CodeArea::Main, &vec![0x90; len])
            .expect("emit translation");
        TransLoc::new(&*self.cache, main, CodeRange::empty(), CodeRange::empty())
    }

    /// A translation with a main body and a cold part.
    pub fn split_translation(&self, main_len: usize, cold_len: usize) -> TransLoc {
        let main = self
            .cache
            .emit(CodeArea::Main, &vec![0x90; main_len])
            .expect("emit main");
        let cold = self
            .cache
            .emit(CodeArea::Cold, &vec![0x90; cold_len])
            .expect("emit cold");
        TransLoc::new(&*self.cache, main, cold, CodeRange::empty())
    }

    pub fn entry(&self, loc: &TransLoc) -> CodeAddr {
        loc.entry(&*self.cache)
    }

    pub fn jmp_site(&self, area: CodeArea) -> BranchSite {
        let addr = emit_smashable_jmp(&self.cache, area, self.cache.base()).expect("emit jmp");
        // SAFETY: freshly emitted jmp inside a cache that outlives the test.
        unsafe { BranchSite::new(BranchKind::Jmp, addr) }
    }

    pub fn jcc_site(&self, area: CodeArea) -> BranchSite {
        let addr = emit_smashable_jcc(&self.cache, area, ConditionCode::NE, self.cache.base())
            .expect("emit jcc");
        // SAFETY: freshly emitted jcc inside a cache that outlives the test.
        unsafe { BranchSite::new(BranchKind::Jcc, addr) }
    }

    pub fn addr_site(&self) -> BranchSite {
        let addr =
            emit_smashable_addr(&self.cache, CodeArea::Frozen, self.cache.base()).expect("emit slot");
        // SAFETY: freshly emitted slot inside a cache that outlives the test.
        unsafe { BranchSite::new(BranchKind::Addr, addr) }
    }

    /// Guard-failure exits for a translation, initially aimed at `dest`.
    pub fn tail_sites(&self, count: usize, dest: CodeAddr) -> Vec<BranchSite> {
        (0..count)
            .map(|i| {
                let site = if i % 2 == 0 {
                    self.jcc_site(CodeArea::Cold)
                } else {
                    self.jmp_site(CodeArea::Cold)
                };
                site.patch(dest);
                site
            })
            .collect()
    }
}
