use serde::Deserialize;

/// Chaining limits and feature switches, handed to `SrcDb` at construction.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SrcDbConfig {
    pub max_translations: u32,
    pub max_profile_translations: u32,
    /// Retired translations give their code space back to the cache.
    pub reusable_tc: bool,
    /// Records may drop their translations via `invalidate_all`.
    pub replaceable_translations: bool,
}

impl Default for SrcDbConfig {
    fn default() -> Self {
        Self {
            max_translations: 12,
            max_profile_translations: 30,
            reusable_tc: false,
            replaceable_translations: true,
        }
    }
}

impl SrcDbConfig {
    /// Largest translation count a record may hold before one more
    /// (interpreter-only) translation is appended.
    pub fn translation_limit(&self) -> usize {
        self.max_translations.max(self.max_profile_translations) as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodeCacheConfig {
    pub main_size: usize,
    pub cold_size: usize,
    pub frozen_size: usize,
    /// Map the cache read-write-execute instead of read-write.
    pub executable: bool,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            main_size: 4 << 20,
            cold_size: 2 << 20,
            frozen_size: 2 << 20,
            executable: true,
        }
    }
}

impl CodeCacheConfig {
    pub fn total_size(&self) -> usize {
        self.main_size + self.cold_size + self.frozen_size
    }
}
