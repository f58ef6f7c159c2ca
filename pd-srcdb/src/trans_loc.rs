use crate::addr::{CodeAddr, CodeOffset, CodeRange};
use crate::code_cache::CodeArea;
use crate::tc::CodeMap;

/// Where one translation lives in the code cache.
///
/// Starts are kept as cache offsets so the layout stays meaningful if the
/// cache mapping moves. The entry point is the start of the first non-empty
/// region in main, cold, frozen order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TransLoc {
    main_off: CodeOffset,
    main_len: u32,
    cold_off: CodeOffset,
    cold_len: u32,
    frozen_off: CodeOffset,
    frozen_len: u32,
}

impl TransLoc {
    pub fn new(map: &dyn CodeMap, main: CodeRange, cold: CodeRange, frozen: CodeRange) -> Self {
        assert!(
            !(main.is_empty() && cold.is_empty() && frozen.is_empty()),
            "translation placement must cover at least one code region"
        );
        let mut loc = Self::default();
        if !main.is_empty() {
            loc.set_main_start(map, main.start);
            loc.main_len = region_len(main);
        }
        if !cold.is_empty() {
            loc.set_cold_start(map, cold.start);
            loc.cold_len = region_len(cold);
        }
        if !frozen.is_empty() {
            loc.set_frozen_start(map, frozen.start);
            loc.frozen_len = region_len(frozen);
        }
        loc
    }

    pub fn entry(&self, map: &dyn CodeMap) -> CodeAddr {
        self.entry_range(map).start
    }

    pub fn entry_range(&self, map: &dyn CodeMap) -> CodeRange {
        self.ranges(map)
            .next()
            .map(|(_, range)| range)
            .unwrap_or_else(|| panic!("translation placement {self:?} has no code"))
    }

    /// Non-empty regions in priority order.
    pub fn ranges<'a>(
        &'a self,
        map: &'a dyn CodeMap,
    ) -> impl Iterator<Item = (CodeArea, CodeRange)> + 'a {
        [
            (CodeArea::Main, self.main_off, self.main_len),
            (CodeArea::Cold, self.cold_off, self.cold_len),
            (CodeArea::Frozen, self.frozen_off, self.frozen_len),
        ]
        .into_iter()
        .filter(|&(_, _, len)| len != 0)
        .map(move |(area, off, len)| {
            (area, CodeRange::new(map.offset_to_addr(off), len as usize))
        })
    }

    pub fn main_start(&self, map: &dyn CodeMap) -> CodeAddr {
        map.offset_to_addr(self.main_off)
    }

    pub fn cold_start(&self, map: &dyn CodeMap) -> CodeAddr {
        map.offset_to_addr(self.cold_off)
    }

    pub fn frozen_start(&self, map: &dyn CodeMap) -> CodeAddr {
        map.offset_to_addr(self.frozen_off)
    }

    pub fn main_len(&self) -> u32 {
        self.main_len
    }

    pub fn cold_len(&self) -> u32 {
        self.cold_len
    }

    pub fn frozen_len(&self) -> u32 {
        self.frozen_len
    }

    pub fn set_main_start(&mut self, map: &dyn CodeMap, start: CodeAddr) {
        self.main_off = checked_offset(map, start);
    }

    pub fn set_cold_start(&mut self, map: &dyn CodeMap, start: CodeAddr) {
        self.cold_off = checked_offset(map, start);
    }

    pub fn set_frozen_start(&mut self, map: &dyn CodeMap, start: CodeAddr) {
        self.frozen_off = checked_offset(map, start);
    }
}

fn checked_offset(map: &dyn CodeMap, start: CodeAddr) -> CodeOffset {
    assert!(
        map.is_valid_code_address(start),
        "{start} is not a valid code address"
    );
    map.addr_to_offset(start)
}

fn region_len(range: CodeRange) -> u32 {
    u32::try_from(range.len)
        .unwrap_or_else(|_| panic!("code region of {} bytes is too large", range.len))
}
