use crate::mem::map::{
    nib_val, run_mask, BITS_PER_NIB, LEFT_NIB, MAP_WORD_BYTES, NIBS_PER_WORD, RIGHT_NIB,
    RUN_END_VAL, RUN_MARK_VAL,
};
use crate::mem::MbPtr;
use crate::utils::mem_context::hunk;

/// Marker for a nibble walk that hit an invalid encoding or ran off the
/// word. Mapped to [`crate::MbErr::MapCorrupt`] at the public boundary.
#[derive(Debug, Copy, Clone)]
pub(crate) struct MapCorrupt;

/// Marker for an allocation scan that completed a full lap without
/// finding a fitting run of free units.
#[derive(Debug, Copy, Clone)]
pub(crate) struct NoRoom;

/// One block space: an occupancy map and the payload region it covers.
///
/// All addresses are offsets into the hunk. Map words live at
/// `map_base`, payload bytes at `payload_base`; word `mi` covers the
/// `word_bytes` payload bytes starting at `mi * word_bytes`.
pub(crate) struct Space {
    unit_bytes: u64,
    word_bytes: u64,
    map_words: u32,
    cursor: u32,
    map_base: MbPtr,
    payload_base: MbPtr,
}

impl Space {
    pub fn new(
        unit_bytes: u64,
        word_bytes: u64,
        map_words: u32,
        map_base: MbPtr,
        payload_base: MbPtr,
    ) -> Self {
        Self {
            unit_bytes,
            word_bytes,
            map_words,
            cursor: 0,
            map_base,
            payload_base,
        }
    }

    #[inline]
    pub fn unit_bytes(&self) -> u64 {
        self.unit_bytes
    }

    #[inline]
    pub fn word_bytes(&self) -> u64 {
        self.word_bytes
    }

    #[inline]
    pub fn map_words(&self) -> u32 {
        self.map_words
    }

    /// Payload bytes covered by this space.
    #[inline]
    pub fn payload_bytes(&self) -> u64 {
        self.map_words as u64 * self.word_bytes
    }

    /// Whether `ptr` lies inside this space's payload region.
    #[inline]
    pub fn contains(&self, ptr: MbPtr) -> bool {
        ptr >= self.payload_base && ptr < self.payload_base + self.payload_bytes()
    }

    pub(crate) fn map_word(&self, mi: u32) -> u32 {
        debug_assert!(mi < self.map_words);

        let mut buf = [0u8; MAP_WORD_BYTES as usize];
        hunk::read(self.map_base + mi as u64 * MAP_WORD_BYTES, &mut buf);

        u32::from_le_bytes(buf)
    }

    pub(crate) fn set_map_word(&mut self, mi: u32, word: u32) {
        debug_assert!(mi < self.map_words);

        hunk::write(self.map_base + mi as u64 * MAP_WORD_BYTES, &word.to_le_bytes());
    }

    /// Next map index, wrapping at the end of the map.
    #[inline]
    fn map_inc(&self, mi: u32) -> u32 {
        if mi + 1 < self.map_words {
            mi + 1
        } else {
            0
        }
    }

    /// Stamp a run of free units able to hold `size` bytes and return its
    /// payload offset.
    ///
    /// The scan starts at the rotating cursor and slides the allocation
    /// mask nibble by nibble through each word, wrapping through the map
    /// at most once. An empty word accepts at slot zero without sliding.
    pub fn allocate(&mut self, size: u64) -> Result<MbPtr, NoRoom> {
        let units = (size + self.unit_bytes - 1) / self.unit_bytes;
        let start_mask = run_mask(units as usize);

        let start = self.cursor;
        let mut mi = start;
        let mut slot: u64 = 0;
        let mut amask = start_mask;

        let mut word = self.map_word(mi);
        while word != 0 {
            if word & amask == 0 {
                // run of free units under the mask
                break;
            }

            if amask & RIGHT_NIB != 0 {
                // the end marker reached the rightmost slot, next word
                mi = self.map_inc(mi);
                slot = 0;
                amask = start_mask;

                if mi == start {
                    return Err(NoRoom);
                }

                word = self.map_word(mi);
            } else {
                amask >>= BITS_PER_NIB;
                slot += 1;
            }
        }

        let stamped = word | amask;
        self.set_map_word(mi, stamped);

        self.cursor = mi;
        if stamped & RIGHT_NIB != 0 {
            // word filled to its last unit, start the next scan one over
            self.cursor = self.map_inc(mi);
        }

        Ok(self.payload_base + mi as u64 * self.word_bytes + slot * self.unit_bytes)
    }

    /// Free the run starting at `ptr`, recovering its length from the map
    /// alone.
    ///
    /// The walk refuses to clear anything when the encoding is broken: a
    /// non-continuation nibble before the end marker (a double free reads
    /// `0` at the start slot), or a run leaving the word, mutates nothing.
    pub fn free_at(&mut self, ptr: MbPtr) -> Result<(), MapCorrupt> {
        debug_assert!(self.contains(ptr));

        let offset = ptr - self.payload_base;
        let mi = (offset / self.word_bytes) as u32;
        let mut slot = ((offset % self.word_bytes) / self.unit_bytes) as usize;

        let word = self.map_word(mi);
        let mut fmask = LEFT_NIB >> (slot as u32 * BITS_PER_NIB);

        while nib_val(word, slot) != RUN_END_VAL {
            if nib_val(word, slot) != RUN_MARK_VAL {
                return Err(MapCorrupt);
            }

            slot += 1;
            if slot >= NIBS_PER_WORD {
                return Err(MapCorrupt);
            }

            fmask |= fmask >> BITS_PER_NIB;
        }

        self.set_map_word(mi, word & !fmask);

        Ok(())
    }

    /// Count allocated runs by length; `counters[k - 1]` accumulates runs
    /// of k units. The walk mirrors [`Space::free_at`]'s run detection.
    pub fn stat_scan(&self, counters: &mut [u32; NIBS_PER_WORD]) -> Result<(), MapCorrupt> {
        for mi in 0..self.map_words {
            let word = self.map_word(mi);

            let mut slot = 0;
            while slot < NIBS_PER_WORD {
                if nib_val(word, slot) == 0 {
                    slot += 1;
                    continue;
                }

                // found a run, walk to its end marker
                let mut len = 1;
                while nib_val(word, slot) != RUN_END_VAL {
                    if nib_val(word, slot) != RUN_MARK_VAL {
                        return Err(MapCorrupt);
                    }

                    slot += 1;
                    len += 1;
                    if slot >= NIBS_PER_WORD {
                        return Err(MapCorrupt);
                    }
                }

                counters[len - 1] += 1;
                slot += 1;
            }
        }

        Ok(())
    }

    /// Whether every unit of this space is free.
    pub fn is_all_free(&self) -> bool {
        (0..self.map_words).all(|mi| self.map_word(mi) == 0)
    }

    /// Print the map words, eight per line.
    pub fn dump(&self, header: &str) {
        println!("{header}");

        for mi in 0..self.map_words {
            print!("{:08X} ", self.map_word(mi));
            if (mi + 1) % 8 == 0 {
                println!();
            }
        }
    }
}
