//! Segment table: the immutable, parser-produced view of an executable's
//! loadable regions.
//!
//! A [`Segment`] mirrors an ELF `PT_LOAD` program header: a virtual base, an
//! in-file range, an in-memory range (which may extend past the file for
//! BSS), and a permission set. The table is produced once by [`crate::elf`]
//! and is read-only for the remainder of execution.

use crate::PAGE;

bitflags::bitflags! {
    /// Segment permission flags, collapsing the file format's program-header
    /// flags into the three bits the fault handler actually needs.
    pub struct Perm: u32 {
        /// Segment is readable.
        const READ = 1 << 0;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is executable.
        const EXEC = 1 << 2;
    }
}

/// A single loadable segment, as described in spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Page-aligned virtual base address.
    pub vaddr: usize,
    /// Byte offset into the file where this segment's content starts.
    pub offset: u64,
    /// Bytes present in the file.
    pub file_size: u64,
    /// Bytes visible in memory (`>= file_size`; the tail is BSS).
    pub mem_size: u64,
    /// Read/write/execute permission set.
    pub perm: Perm,
}

impl Segment {
    /// First address past this segment's in-memory image, rounded up to the
    /// next page. A fault anywhere in the trailing slack of the last page
    /// still belongs to this segment (spec.md §4.1, "Why round up").
    pub fn mem_end_rounded(&self) -> usize {
        round_up(self.vaddr + self.mem_size as usize, PAGE)
    }

    /// First address past this segment's file-backed content.
    pub fn file_end(&self) -> usize {
        self.vaddr + self.file_size as usize
    }

    /// `true` if `addr` falls within this segment's (page-rounded) memory
    /// range.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.vaddr && addr < self.mem_end_rounded()
    }
}

/// Round `value` up to the next multiple of `page` (`page` must be a power
/// of two).
pub fn round_up(value: usize, page: usize) -> usize {
    (value + page - 1) & !(page - 1)
}

/// Ordered, read-only sequence of segments produced by the parser.
///
/// Segments do not overlap in virtual address space (a parser invariant);
/// lookup is therefore unambiguous and a linear scan is sufficient at the
/// segment counts statically linked binaries have (spec.md §4.1, "Policy").
#[derive(Clone, Debug, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of pages across all segments, rounding each segment's
    /// `mem_size` up independently. Used to pre-size the [`crate::registry::PageRegistry`]
    /// (spec.md §9).
    pub fn total_pages(&self) -> usize {
        self.segments
            .iter()
            .map(|s| round_up(s.mem_size as usize, PAGE) / PAGE)
            .sum()
    }

    /// Segment lookup contract (spec.md §4.1): the unique segment owning
    /// `addr`, or `None` if `addr` lies outside every segment.
    pub fn find(&self, addr: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(vaddr: usize, offset: u64, file_size: u64, mem_size: u64) -> Segment {
        Segment {
            vaddr,
            offset,
            file_size,
            mem_size,
            perm: Perm::READ,
        }
    }

    #[test]
    fn round_up_is_identity_on_page_multiples() {
        assert_eq!(round_up(0x1000, PAGE), 0x1000);
        assert_eq!(round_up(0, PAGE), 0);
    }

    #[test]
    fn round_up_rounds_partial_pages() {
        assert_eq!(round_up(0x1001, PAGE), 0x2000);
        assert_eq!(round_up(0x0FFF, PAGE), 0x1000);
    }

    #[test]
    fn mem_end_rounds_up_trailing_slack() {
        // mem_size = 0x1200 ends mid-page; the owning range must extend to
        // the next page boundary, not stop at 0x1200.
        let s = seg(0x1000, 0, 0x800, 0x1200);
        assert_eq!(s.mem_end_rounded(), 0x3000);
        assert!(s.contains(0x2f00));
        assert!(!s.contains(0x3000));
    }

    #[test]
    fn mem_end_does_not_over_round_exact_multiples() {
        // A segment whose mem_size is already page-aligned must not claim
        // an extra page (spec.md §9, "Open question: end-of-segment rounding").
        let s = seg(0x1000, 0, 0x1000, 0x1000);
        assert_eq!(s.mem_end_rounded(), 0x2000);
        assert!(!s.contains(0x2000));
    }

    #[test]
    fn table_find_returns_owning_segment() {
        let table = SegmentTable::new(vec![
            seg(0x1000, 0, 0x1000, 0x1000),
            seg(0x3000, 0x1000, 0x800, 0x1800),
        ]);
        assert_eq!(table.find(0x1500).unwrap().vaddr, 0x1000);
        assert_eq!(table.find(0x3900).unwrap().vaddr, 0x3000);
        assert!(table.find(0x2000).is_none());
        assert!(table.find(0xDEADBEEF).is_none());
    }

    #[test]
    fn total_pages_sums_rounded_page_counts() {
        let table = SegmentTable::new(vec![
            seg(0x1000, 0, 0x1000, 0x1000), // 1 page
            seg(0x3000, 0x1000, 0x800, 0x1800), // 2 pages
        ]);
        assert_eq!(table.total_pages(), 3);
    }
}
