use crate::error::MbErr;
use crate::mem::map::{
    BIG_UNIT_BYTES, BIG_WORD_BYTES, MAP_WORD_BYTES, NIBS_PER_WORD, SMALL_UNIT_BYTES,
    SMALL_WORD_BYTES,
};
use crate::mem::space::{MapCorrupt, NoRoom, Space};
use crate::mem::MbPtr;
use crate::utils::mem_context::hunk;
use crate::utils::MemMetrics;

/// Number of counters per space in a [`BlockStat`].
pub const STAT_SLOTS: usize = NIBS_PER_WORD;

pub(crate) const SPACE_SMALL: usize = 0;
pub(crate) const SPACE_BIG: usize = 1;
pub(crate) const SPACE_COUNT: usize = 2;

/// Live allocation counts per run length: `small[k - 1]` and `big[k - 1]`
/// count runs of k units in their space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub small: [u32; STAT_SLOTS],
    pub big: [u32; STAT_SLOTS],
}

/// The library control block: both block spaces plus the last error code.
pub(crate) struct BlockAllocator {
    err: MbErr,
    spaces: [Space; SPACE_COUNT],
}

impl BlockAllocator {
    /// Set up both spaces over one contiguous, zeroed host acquisition,
    /// laid out SMALL map | SMALL payload | BIG map | BIG payload.
    ///
    /// Each argument is a count of 1024 smallest blocks for its space.
    pub fn init(k_small: usize, k_big: usize) -> Self {
        assert!(
            k_small > 0 && k_big > 0,
            "each space needs at least 1k of smallest blocks"
        );

        let small_words = (k_small * 1024 / NIBS_PER_WORD) as u32;
        let big_words = (k_big * 1024 / NIBS_PER_WORD) as u32;

        let small_map = 0u64;
        let small_payload = small_map + small_words as u64 * MAP_WORD_BYTES;
        let big_map = small_payload + small_words as u64 * SMALL_WORD_BYTES;
        let big_payload = big_map + big_words as u64 * MAP_WORD_BYTES;
        let total = big_payload + big_words as u64 * BIG_WORD_BYTES;

        hunk::acquire(total).expect("Out of host memory (init)");

        Self {
            err: MbErr::Ok,
            spaces: [
                Space::new(
                    SMALL_UNIT_BYTES,
                    SMALL_WORD_BYTES,
                    small_words,
                    small_map,
                    small_payload,
                ),
                Space::new(BIG_UNIT_BYTES, BIG_WORD_BYTES, big_words, big_map, big_payload),
            ],
        }
    }

    /// Return the bulk acquisition to the host.
    pub fn term(self) {
        hunk::release();
    }

    #[inline]
    pub fn last_err(&self) -> MbErr {
        self.err
    }

    /// Allocate `size` bytes from the smallest space able to hold them.
    ///
    /// `None` means the error code holds the reason: `TooBig` when no
    /// space covers the request, `NoMem` when the sized space is full.
    pub fn allocate(&mut self, size: usize) -> Option<MbPtr> {
        if size == 0 {
            // a zero-unit run would stamp nothing; refuse it outright
            log::debug!("refusing zero-size allocation");
            self.err = MbErr::TooBig;
            return None;
        }

        let Some(space) = self
            .spaces
            .iter_mut()
            .find(|space| size as u64 <= space.word_bytes())
        else {
            log::debug!("cannot allocate {size} bytes, only up to {BIG_WORD_BYTES} at a time");
            self.err = MbErr::TooBig;
            return None;
        };

        match space.allocate(size as u64) {
            Ok(ptr) => {
                log::trace!("allocated {size} bytes at offset {ptr}");
                self.err = MbErr::Ok;

                Some(ptr)
            }
            Err(NoRoom) => {
                log::debug!("no space found for {size} bytes");
                self.err = MbErr::NoMem;

                None
            }
        }
    }

    /// Free the run starting at `ptr`, which must have been returned by
    /// [`BlockAllocator::allocate`] and not freed since.
    pub fn free(&mut self, ptr: MbPtr) {
        let Some(space) = self.spaces.iter_mut().find(|space| space.contains(ptr)) else {
            log::debug!("tried to free offset {ptr} not owned by mblib");
            self.err = MbErr::Unknown;
            return;
        };

        match space.free_at(ptr) {
            Ok(()) => {
                log::trace!("freed offset {ptr}");
                self.err = MbErr::Ok;
            }
            Err(MapCorrupt) => {
                log::debug!("map corruption detected freeing offset {ptr}");
                self.err = MbErr::MapCorrupt;
            }
        }
    }

    /// Scan both maps into per-run-length counters. `None` means a map
    /// encoding violation was found and `MapCorrupt` recorded.
    pub fn stat_get(&mut self) -> Option<BlockStat> {
        let mut stat = BlockStat::default();

        for (i, space) in self.spaces.iter().enumerate() {
            let counters = if i == SPACE_SMALL {
                &mut stat.small
            } else {
                &mut stat.big
            };

            if space.stat_scan(counters).is_err() {
                log::debug!("map corruption detected during stats scan");
                self.err = MbErr::MapCorrupt;
                return None;
            }
        }

        self.err = MbErr::Ok;

        Some(stat)
    }

    /// Byte totals across both spaces, derived from a stats scan.
    pub fn mem_metrics(&mut self) -> Option<MemMetrics> {
        let stat = self.stat_get()?;

        let mut allocated = 0u64;
        let per_space = [
            (&stat.small, &self.spaces[SPACE_SMALL]),
            (&stat.big, &self.spaces[SPACE_BIG]),
        ];
        for (counters, space) in per_space {
            for (i, count) in counters.iter().enumerate() {
                allocated += *count as u64 * (i as u64 + 1) * space.unit_bytes();
            }
        }

        let available: u64 = self.spaces.iter().map(Space::payload_bytes).sum();

        Some(MemMetrics {
            available,
            free: available - allocated,
            allocated,
        })
    }

    /// Whether both spaces are entirely free.
    pub fn test_free(&self) -> bool {
        self.spaces.iter().all(Space::is_all_free)
    }

    /// Print both occupancy maps. Debug surface, format not contractual.
    pub fn dump_map(&self) {
        self.spaces[SPACE_SMALL].dump("-------- Small Block Map --------");
        self.spaces[SPACE_BIG].dump("-------- Big Block Map --------");
    }

    /// Print the per-run-length allocation counters. Debug surface.
    pub fn dump_stat(&mut self) {
        println!("\n---- Block Allocation Statistics ----");

        let stat = self.stat_get();
        let (small, big) = match &stat {
            Some(stat) => (&stat.small[..], &stat.big[..]),
            None => (&[][..], &[][..]),
        };

        print!("-- small blocks : ");
        for count in small {
            print!("{count:06} ");
        }
        print!("\n--   big blocks : ");
        for count in big {
            print!("{count:06} ");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use crate::error::MbErr;
    use crate::mem::allocator::{BlockAllocator, SPACE_BIG, SPACE_SMALL};

    #[test]
    fn initialization_works_fine() {
        let mb = BlockAllocator::init(2, 1);

        assert_eq!(mb.last_err(), MbErr::Ok);
        assert!(mb.test_free());

        assert_eq!(mb.spaces[SPACE_SMALL].map_words(), 256);
        assert_eq!(mb.spaces[SPACE_SMALL].payload_bytes(), 2 * 1024 * 16);
        assert_eq!(mb.spaces[SPACE_BIG].map_words(), 128);
        assert_eq!(mb.spaces[SPACE_BIG].payload_bytes(), 1024 * 256);

        mb.term();
    }

    #[test]
    fn whole_word_allocation_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let ptr = mb.allocate(128).unwrap();
        assert_eq!(mb.spaces[SPACE_SMALL].map_word(0), 0xFFFF_FFF1);

        mb.free(ptr);
        assert_eq!(mb.spaces[SPACE_SMALL].map_word(0), 0);
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn one_unit_runs_work_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let a = mb.allocate(1).unwrap();
        let b = mb.allocate(16).unwrap();
        assert_eq!(b - a, 16);
        assert_eq!(mb.spaces[SPACE_SMALL].map_word(0), 0x1100_0000);

        mb.free(a);
        mb.free(b);
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn space_selection_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let small = mb.allocate(128).unwrap();
        assert!(mb.spaces[SPACE_SMALL].contains(small));

        // one byte over the small word coverage crosses into the big space
        let big = mb.allocate(129).unwrap();
        assert!(mb.spaces[SPACE_BIG].contains(big));

        mb.free(small);
        mb.free(big);
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn size_rounding_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        for size in [1usize, 16, 17, 31, 48, 127, 128] {
            let units = (size + 15) / 16;

            let ptr = mb.allocate(size).unwrap();
            let stat = mb.stat_get().unwrap();
            assert_eq!(stat.small[units - 1], 1, "size {size}");
            assert_eq!(stat.small.iter().sum::<u32>(), 1);

            mb.free(ptr);
            assert!(mb.test_free());
        }

        for size in [129usize, 256, 300, 512, 2000, 2048] {
            let units = (size + 255) / 256;

            let ptr = mb.allocate(size).unwrap();
            let stat = mb.stat_get().unwrap();
            assert_eq!(stat.big[units - 1], 1, "size {size}");

            mb.free(ptr);
            assert!(mb.test_free());
        }

        mb.term();
    }

    #[test]
    fn error_paths_work_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        assert_eq!(mb.allocate(2049), None);
        assert_eq!(mb.last_err(), MbErr::TooBig);

        assert_eq!(mb.allocate(0), None);
        assert_eq!(mb.last_err(), MbErr::TooBig);

        mb.free(u64::MAX);
        assert_eq!(mb.last_err(), MbErr::Unknown);

        // the small map itself is not payload
        mb.free(0);
        assert_eq!(mb.last_err(), MbErr::Unknown);

        // a successful operation stores OK again
        let ptr = mb.allocate(64).unwrap();
        assert_eq!(mb.last_err(), MbErr::Ok);
        mb.free(ptr);
        assert_eq!(mb.last_err(), MbErr::Ok);

        mb.term();
    }

    #[test]
    fn double_free_detection_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let a = mb.allocate(48).unwrap();
        let b = mb.allocate(16).unwrap();

        mb.free(a);
        assert_eq!(mb.last_err(), MbErr::Ok);

        mb.free(a);
        assert_eq!(mb.last_err(), MbErr::MapCorrupt);

        // the neighboring run survived the stale free
        let stat = mb.stat_get().unwrap();
        assert_eq!(stat.small[0], 1);

        mb.free(b);
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn first_fit_slide_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let a = mb.allocate(16).unwrap();
        let b = mb.allocate(32).unwrap();
        let c = mb.allocate(16).unwrap();
        assert_eq!(b - a, 16);
        assert_eq!(c - b, 32);

        mb.free(b);

        // three units do not fit the two-unit hole, they land past c
        let d = mb.allocate(48).unwrap();
        assert_eq!(d - c, 16);

        // but two units slide back into the hole b left
        let e = mb.allocate(32).unwrap();
        assert_eq!(e, b);

        for ptr in [a, c, d, e] {
            mb.free(ptr);
        }
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn wrap_around_scan_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let words = mb.spaces[SPACE_SMALL].map_words();
        let mut blocks = Vec::new();
        for _ in 0..words {
            blocks.push(mb.allocate(128).unwrap());
        }

        assert_eq!(mb.allocate(128), None);
        assert_eq!(mb.last_err(), MbErr::NoMem);

        // the scan walks the full prefix to land on the hole
        let hole = blocks[5];
        mb.free(hole);
        let again = mb.allocate(128).unwrap();
        assert_eq!(again, hole);

        for ptr in blocks {
            mb.free(ptr);
        }
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn cursor_rotation_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        // filling a word to its last unit advances the cursor
        let a = mb.allocate(128).unwrap();
        let b = mb.allocate(128).unwrap();
        assert_eq!(b - a, 128);

        // the next scan starts at the cursor, not back at the front
        mb.free(a);
        let c = mb.allocate(128).unwrap();
        assert!(c > b);

        for ptr in [b, c] {
            mb.free(ptr);
        }
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn corrupt_map_detection_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let a = mb.allocate(16).unwrap();

        // a run that never terminates
        mb.spaces[SPACE_SMALL].set_map_word(0, 0xFFFF_FFFF);
        assert!(mb.stat_get().is_none());
        assert_eq!(mb.last_err(), MbErr::MapCorrupt);

        // freeing into the broken word refuses to touch it
        mb.free(a);
        assert_eq!(mb.last_err(), MbErr::MapCorrupt);
        assert_eq!(mb.spaces[SPACE_SMALL].map_word(0), 0xFFFF_FFFF);

        // a nibble outside the encoding
        mb.spaces[SPACE_SMALL].set_map_word(0, 0x7000_0000);
        assert!(mb.stat_get().is_none());
        assert_eq!(mb.last_err(), MbErr::MapCorrupt);

        mb.spaces[SPACE_SMALL].set_map_word(0, 0);
        assert!(mb.test_free());

        mb.term();
    }

    #[test]
    fn stats_aggregation_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let a = mb.allocate(16).unwrap();
        let b = mb.allocate(48).unwrap();
        let c = mb.allocate(16).unwrap();
        let d = mb.allocate(2048).unwrap();

        let stat = mb.stat_get().unwrap();
        assert_eq!(stat.small[0], 2);
        assert_eq!(stat.small[2], 1);
        assert_eq!(stat.big[7], 1);
        assert_eq!(stat.small.iter().sum::<u32>(), 3);
        assert_eq!(stat.big.iter().sum::<u32>(), 1);

        for ptr in [a, b, c, d] {
            mb.free(ptr);
        }
        assert_eq!(mb.stat_get().unwrap(), Default::default());

        mb.term();
    }

    #[test]
    fn mem_metrics_works_fine() {
        let mut mb = BlockAllocator::init(1, 1);

        let m = mb.mem_metrics().unwrap();
        assert_eq!(m.available, 1024 * 16 + 1024 * 256);
        assert_eq!(m.allocated, 0);
        assert_eq!(m.free, m.available);

        let a = mb.allocate(20).unwrap(); // rounds to 32
        let b = mb.allocate(300).unwrap(); // rounds to 512

        let m = mb.mem_metrics().unwrap();
        assert_eq!(m.allocated, 32 + 512);
        assert_eq!(m.free, m.available - (32 + 512));

        mb.free(a);
        mb.free(b);

        mb.term();
    }
}
