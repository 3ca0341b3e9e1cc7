// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug)]
struct BlockBits {
    words: Vec<u64>,
    marked: usize,
}

/// Fixed-capacity bitmap of the done slots of one block.
///
/// Slot `i` stands for relative offset `block_start + i`. Every block guards
/// its bitmap with its own lock so completions landing in different blocks
/// never contend.
#[derive(Debug)]
pub struct OffsetBlock {
    capacity: usize,
    bits: Mutex<BlockBits>,
}

impl OffsetBlock {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            capacity,
            bits: Mutex::new(BlockBits {
                words: vec![0; capacity.div_ceil(WORD_BITS)],
                marked: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets `slot`. Returns false for duplicates, for a block that is already
    /// full and for slots outside the block.
    pub fn mark(&self, slot: usize) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let mut bits = self.bits.lock();
        if bits.marked >= self.capacity {
            return false;
        }
        let (word, mask) = (slot / WORD_BITS, 1u64 << (slot % WORD_BITS));
        if bits.words[word] & mask != 0 {
            return false;
        }
        bits.words[word] |= mask;
        bits.marked += 1;
        true
    }

    pub fn is_full(&self) -> bool {
        self.bits.lock().marked == self.capacity
    }

    pub fn marked_count(&self) -> usize {
        self.bits.lock().marked
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let bits = self.bits.lock();
        bits.words[slot / WORD_BITS] & (1u64 << (slot % WORD_BITS)) != 0
    }

    /// Length of the unbroken run of set slots starting at slot 0.
    pub fn max_contiguous_from_zero(&self) -> usize {
        let bits = self.bits.lock();
        let mut count = 0;
        for word in &bits.words {
            if *word == u64::MAX {
                count += WORD_BITS;
                continue;
            }
            count += word.trailing_ones() as usize;
            break;
        }
        count.min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1)]
    #[case(16)]
    #[case(64)]
    #[case(1024)]
    fn fills_after_capacity_distinct_marks(#[case] capacity: usize) {
        let block = OffsetBlock::new(capacity);
        for slot in (0..capacity).rev() {
            assert!(!block.is_full());
            assert!(block.mark(slot));
        }
        assert!(block.is_full());
        assert_eq!(block.marked_count(), capacity);
        assert_eq!(block.max_contiguous_from_zero(), capacity);
        // full block rejects everything
        assert!(!block.mark(0));
    }

    #[test]
    fn duplicate_mark_counts_once() {
        let block = OffsetBlock::new(16);
        assert!(block.mark(3));
        assert!(!block.mark(3));
        assert!(!block.mark(3));
        assert_eq!(block.marked_count(), 1);
        assert!(block.is_marked(3));
        assert!(!block.is_marked(4));
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let block = OffsetBlock::new(16);
        assert!(!block.mark(16));
        assert!(!block.mark(usize::MAX));
        assert_eq!(block.marked_count(), 0);
        assert!(!block.is_marked(16));
    }

    #[test]
    fn contiguous_prefix_stops_at_first_gap() {
        let block = OffsetBlock::new(128);
        assert_eq!(block.max_contiguous_from_zero(), 0);

        block.mark(1);
        block.mark(2);
        assert_eq!(block.max_contiguous_from_zero(), 0);

        block.mark(0);
        assert_eq!(block.max_contiguous_from_zero(), 3);

        // prefix crossing a word boundary
        for slot in 3..70 {
            block.mark(slot);
        }
        block.mark(100);
        assert_eq!(block.max_contiguous_from_zero(), 70);
    }

    #[test]
    fn concurrent_marks_are_counted_exactly_once() {
        let block = Arc::new(OffsetBlock::new(256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let block = block.clone();
                std::thread::spawn(move || (0..256).filter(|slot| block.mark(*slot)).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 256);
        assert!(block.is_full());
    }
}
