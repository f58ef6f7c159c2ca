//! Services the chaining core consumes from the rest of the translation
//! cache. `SrcDb` wires concrete implementations; tests may substitute
//! their own.

use std::sync::Arc;

use crate::addr::{CodeAddr, CodeOffset};
use crate::config::SrcDbConfig;
use crate::srcdb::SrcKey;
use crate::trans_loc::TransLoc;

/// Bidirectional mapping between relocation-stable offsets and addresses.
pub trait CodeMap: Send + Sync {
    fn offset_to_addr(&self, offset: CodeOffset) -> CodeAddr;
    fn addr_to_offset(&self, addr: CodeAddr) -> CodeOffset;
    fn is_valid_code_address(&self, addr: CodeAddr) -> bool;
}

/// Hook told which record owns a branch site, so code ranges can later be
/// unlinked in bulk.
pub trait JumpRecorder: Send + Sync {
    fn record_jump(&self, to_smash: CodeAddr, owner: SrcKey);
}

/// Accepts retired translations and reuses their space only once no thread
/// can still be executing inside them.
pub trait TranslationReclaimer: Send + Sync {
    fn reclaim_translations(&self, owner: SrcKey, translations: Vec<TransLoc>);
}

#[derive(Clone)]
pub struct TcServices {
    pub config: SrcDbConfig,
    pub code: Arc<dyn CodeMap>,
    pub jumps: Arc<dyn JumpRecorder>,
    pub reclaimer: Arc<dyn TranslationReclaimer>,
}

impl std::fmt::Debug for TcServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
