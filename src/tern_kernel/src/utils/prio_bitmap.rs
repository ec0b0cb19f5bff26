//! A word-array priority bitmap supporting a "find first set" scan.
//!
//! Bit *p* corresponds to priority *p*; a smaller index is a better
//! priority, so "find first set" returns the best ready priority.
use core::fmt;

use super::Init;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// The number of words needed to hold `levels` priority bits. Used by the
/// `build!` macro to instantiate [`PrioBitmap`].
pub const fn prio_bitmap_words(levels: usize) -> usize {
    (levels + WORD_LEN - 1) / WORD_LEN
}

/// A fixed-size bit array over priority levels.
pub struct PrioBitmap<const WORDS: usize> {
    bits: [Word; WORDS],
}

impl<const WORDS: usize> Clone for PrioBitmap<WORDS> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<const WORDS: usize> Copy for PrioBitmap<WORDS> {}

impl<const WORDS: usize> Init for PrioBitmap<WORDS> {
    const INIT: Self = Self { bits: [0; WORDS] };
}

impl<const WORDS: usize> fmt::Debug for PrioBitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(
                self.bits
                    .iter()
                    .enumerate()
                    .flat_map(|(word_i, &word)| {
                        (0..WORD_LEN)
                            .filter(move |bit| word & (1 << bit) != 0)
                            .map(move |bit| word_i * WORD_LEN + bit)
                    }),
            )
            .finish()
    }
}

impl<const WORDS: usize> PrioBitmap<WORDS> {
    pub fn get(&self, i: usize) -> bool {
        self.bits[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    pub fn set(&mut self, i: usize) {
        self.bits[i / WORD_LEN] |= 1 << (i % WORD_LEN);
    }

    pub fn clear(&mut self, i: usize) {
        self.bits[i / WORD_LEN] &= !(1 << (i % WORD_LEN));
    }

    /// Get the position of the first (best-priority) set bit.
    pub fn find_first_set(&self) -> Option<usize> {
        for (word_i, &word) in self.bits.iter().enumerate() {
            if word != 0 {
                return Some(word_i * WORD_LEN + word.trailing_zeros() as usize);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    fn test_inner<const WORDS: usize>(bytecode: Vec<u8>, len: usize) {
        let mut subject = PrioBitmap::<WORDS>::INIT;
        let mut reference = BTreeSet::new();

        log::info!("len = {len}");

        for instr in bytecode.chunks_exact(2) {
            let bit = instr[1] as usize % len;
            if instr[0] % 2 == 0 {
                subject.set(bit);
                reference.insert(bit);
            } else {
                subject.clear(bit);
                reference.remove(&bit);
            }

            assert_eq!(subject.find_first_set(), reference.iter().next().cloned());
        }

        let set_bits: Vec<usize> = (0..len).filter(|&i| subject.get(i)).collect();
        let reference_bits: Vec<usize> = reference.iter().cloned().collect();
        assert_eq!(set_bits, reference_bits);
    }

    #[quickcheck]
    fn size_8(bytecode: Vec<u8>) {
        test_inner::<{ prio_bitmap_words(8) }>(bytecode, 8);
    }

    #[quickcheck]
    fn size_62(bytecode: Vec<u8>) {
        test_inner::<{ prio_bitmap_words(62) }>(bytecode, 62);
    }

    #[quickcheck]
    fn size_140(bytecode: Vec<u8>) {
        test_inner::<{ prio_bitmap_words(140) }>(bytecode, 140);
    }
}
