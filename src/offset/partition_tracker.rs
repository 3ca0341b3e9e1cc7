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

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::OffsetBlock;
use crate::message::TopicPartition;
use crate::AppResult;

pub const PERSIST_ATTEMPTS: usize = 3;
const PERSIST_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Windowed completion tracker of one topic-partition for one generation.
///
/// Offsets are split into blocks of `block_capacity` relative to
/// `start_offset`. The commit point only moves once the head block (lowest
/// block start) is completely marked, so it never passes an offset that is
/// still in flight even though completions arrive in any order.
#[derive(Debug)]
pub struct PartitionOffsetTracker {
    group_id: String,
    topic_partition: TopicPartition,
    start_offset: i64,
    block_capacity: usize,
    slot_mask: i64,
    epoch: u32,
    blocks: RwLock<BTreeMap<i64, Arc<OffsetBlock>>>,
    /// relative start of the lowest block that may still be marked
    floor: AtomicI64,
    persisting: AtomicBool,
}

/// Releases the persist latch even if the advancing future is dropped.
struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PartitionOffsetTracker {
    pub fn new(
        group_id: impl Into<String>,
        topic_partition: TopicPartition,
        start_offset: i64,
        block_capacity: usize,
        epoch: u32,
    ) -> Self {
        let block_capacity = block_capacity.max(1).next_power_of_two();
        let mut blocks = BTreeMap::new();
        blocks.insert(0, Arc::new(OffsetBlock::new(block_capacity)));
        Self {
            group_id: group_id.into(),
            topic_partition,
            start_offset,
            block_capacity,
            slot_mask: block_capacity as i64 - 1,
            epoch,
            blocks: RwLock::new(blocks),
            floor: AtomicI64::new(0),
            persisting: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn head_block_start(&self) -> Option<i64> {
        self.blocks.read().keys().next().copied()
    }

    pub fn block_starts(&self) -> Vec<i64> {
        self.blocks.read().keys().copied().collect()
    }

    pub fn block(&self, block_start: i64) -> Option<Arc<OffsetBlock>> {
        self.blocks.read().get(&block_start).cloned()
    }

    /// Trailing edge: the lowest absolute offset not yet proven complete.
    pub fn committed_offset(&self) -> Option<i64> {
        self.head_block_start()
            .map(|head_start| self.start_offset + head_start)
    }

    /// Marks `offset` done. Returns true when this mark completed the head
    /// block, meaning the commit point can advance.
    pub fn mark_done(&self, offset: i64) -> bool {
        let relative = offset - self.start_offset;
        if relative < 0 {
            trace!(
                "{} offset {} below tracker start {}, ignored",
                self.topic_partition,
                offset,
                self.start_offset
            );
            return false;
        }
        let block_start = relative & !self.slot_mask;
        let slot = (relative & self.slot_mask) as usize;

        let Some(block) = self.get_or_create_block(block_start) else {
            trace!(
                "{} offset {} already committed, ignored",
                self.topic_partition,
                offset
            );
            return false;
        };
        if !block.mark(slot) {
            return false;
        }
        block.is_full() && self.head_block_start() == Some(block_start)
    }

    fn get_or_create_block(&self, block_start: i64) -> Option<Arc<OffsetBlock>> {
        {
            let blocks = self.blocks.read();
            if block_start < self.floor.load(Ordering::Acquire) {
                return None;
            }
            if let Some(block) = blocks.get(&block_start) {
                return Some(block.clone());
            }
        }
        let mut blocks = self.blocks.write();
        if block_start < self.floor.load(Ordering::Acquire) {
            return None;
        }
        let capacity = self.block_capacity;
        Some(
            blocks
                .entry(block_start)
                .or_insert_with(|| Arc::new(OffsetBlock::new(capacity)))
                .clone(),
        )
    }

    fn head_is_full(&self) -> bool {
        self.blocks
            .read()
            .first_key_value()
            .is_some_and(|(_, block)| block.is_full())
    }

    /// Advances the commit point past every full head block, persisting each
    /// new commit offset through `persist`.
    ///
    /// Only one caller advances at a time; a caller that loses the latch
    /// returns at once and the winner picks up whatever it completed.
    pub async fn try_advance_and_persist<F, Fut>(&self, persist: F)
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        loop {
            if self
                .persisting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _latch = LatchGuard(&self.persisting);
                self.drain_full_heads(&persist).await;
            }
            // a loser may have filled the head between the last check and the release
            if !self.head_is_full() {
                return;
            }
        }
    }

    async fn drain_full_heads<F, Fut>(&self, persist: &F)
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let capacity = self.block_capacity as i64;
        loop {
            let head_start = {
                let blocks = self.blocks.read();
                match blocks.first_key_value() {
                    Some((start, block)) if block.is_full() => *start,
                    _ => return,
                }
            };

            let commit_offset = self.start_offset + head_start + capacity;
            self.persist_with_retry(persist, commit_offset).await;

            let next_start = head_start + capacity;
            {
                let mut blocks = self.blocks.write();
                blocks.remove(&head_start);
                self.floor.store(next_start, Ordering::Release);
                let block_capacity = self.block_capacity;
                blocks
                    .entry(next_start)
                    .or_insert_with(|| Arc::new(OffsetBlock::new(block_capacity)));
            }
            debug!(
                "group {} {} advanced commit offset to {}",
                self.group_id, self.topic_partition, commit_offset
            );
        }
    }

    async fn persist_with_retry<F, Fut>(&self, persist: &F, offset: i64) -> bool
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match persist(offset).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        "group {} {} persist offset {} failed (attempt {}/{}): {}",
                        self.group_id, self.topic_partition, offset, attempt, PERSIST_ATTEMPTS, err
                    );
                    if attempt < PERSIST_ATTEMPTS {
                        tokio::time::sleep(PERSIST_RETRY_BACKOFF).await;
                    }
                }
            }
        }
        error!(
            "group {} {} gave up persisting offset {}",
            self.group_id, self.topic_partition, offset
        );
        false
    }

    /// Persists the end of the unbroken completed prefix of the head block
    /// and returns it. Completions after the first gap are not counted; they
    /// are redelivered from the returned offset.
    pub async fn persist_final_on_shutdown<F, Fut>(&self, persist: F) -> i64
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let (head_start, contiguous) = {
            let blocks = self.blocks.read();
            match blocks.first_key_value() {
                Some((start, block)) => (*start, block.max_contiguous_from_zero() as i64),
                None => (self.floor.load(Ordering::Acquire), 0),
            }
        };
        let offset = self.start_offset + head_start + contiguous;
        if let Err(err) = persist(offset).await {
            warn!(
                "group {} {} salvage persist of offset {} failed: {}",
                self.group_id, self.topic_partition, offset, err
            );
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::AppError;

    fn tracker(start: i64, capacity: usize) -> PartitionOffsetTracker {
        PartitionOffsetTracker::new("billing", TopicPartition::new("orders", 0), start, capacity, 0)
    }

    #[derive(Default, Clone)]
    struct Recorder {
        saved: Arc<Mutex<Vec<i64>>>,
    }

    impl Recorder {
        fn persist(&self) -> impl Fn(i64) -> std::future::Ready<AppResult<()>> + '_ {
            move |offset| {
                self.saved.lock().push(offset);
                std::future::ready(Ok(()))
            }
        }

        fn saved(&self) -> Vec<i64> {
            self.saved.lock().clone()
        }
    }

    #[tokio::test]
    async fn head_block_fill_signals_advance() {
        let tracker = tracker(0, 16);
        for offset in [3, 0, 14, 7, 1, 2, 4, 5, 6, 8, 9, 10, 11, 12, 13] {
            assert!(!tracker.mark_done(offset));
        }
        assert!(tracker.mark_done(15));
    }

    #[tokio::test]
    async fn advance_persists_and_creates_next_block() {
        let tracker = tracker(0, 16);
        let recorder = Recorder::default();
        for offset in 0..16 {
            tracker.mark_done(offset);
        }
        tracker.try_advance_and_persist(recorder.persist()).await;

        assert_eq!(recorder.saved(), vec![16]);
        assert_eq!(tracker.block_starts(), vec![16]);
        let head = tracker.block(16).unwrap();
        assert!(!head.is_full());
        assert_eq!(head.marked_count(), 0);
        assert_eq!(tracker.committed_offset(), Some(16));
    }

    #[tokio::test]
    async fn burst_across_two_blocks() {
        let tracker = tracker(0, 16);
        let recorder = Recorder::default();
        for offset in 0..20 {
            tracker.mark_done(offset);
        }
        assert_eq!(tracker.block_starts(), vec![0, 16]);
        assert!(tracker.block(0).unwrap().is_full());
        assert_eq!(tracker.block(16).unwrap().marked_count(), 4);

        tracker.try_advance_and_persist(recorder.persist()).await;
        assert_eq!(tracker.block_starts(), vec![16]);
        assert_eq!(tracker.block(16).unwrap().marked_count(), 4);

        let salvaged = tracker.persist_final_on_shutdown(recorder.persist()).await;
        assert_eq!(salvaged, 20);
        assert_eq!(recorder.saved(), vec![16, 20]);
    }

    #[tokio::test]
    async fn salvage_stops_at_first_gap() {
        let tracker = tracker(100, 16);
        let recorder = Recorder::default();
        for offset in [100, 101, 102, 104, 105] {
            tracker.mark_done(offset);
        }
        let salvaged = tracker.persist_final_on_shutdown(recorder.persist()).await;
        assert_eq!(salvaged, 103);
        // salvage never removes the head
        assert_eq!(tracker.block_starts(), vec![0]);
    }

    #[tokio::test]
    async fn advance_walks_several_full_blocks() {
        let tracker = tracker(1000, 4);
        let recorder = Recorder::default();
        // fill blocks 1 and 2 before the head
        for offset in 1004..1012 {
            assert!(!tracker.mark_done(offset));
        }
        for offset in 1000..1003 {
            assert!(!tracker.mark_done(offset));
        }
        assert!(tracker.mark_done(1003));
        tracker.try_advance_and_persist(recorder.persist()).await;

        assert_eq!(recorder.saved(), vec![1004, 1008, 1012]);
        assert_eq!(tracker.block_starts(), vec![12]);
    }

    #[tokio::test]
    async fn full_non_head_block_does_not_signal() {
        let tracker = tracker(0, 4);
        for offset in 4..7 {
            tracker.mark_done(offset);
        }
        assert!(!tracker.mark_done(7));
        assert_eq!(tracker.committed_offset(), Some(0));
    }

    #[tokio::test]
    async fn redelivered_offsets_are_ignored() {
        let tracker = tracker(50, 4);
        let recorder = Recorder::default();
        assert!(!tracker.mark_done(49));
        for offset in 50..54 {
            tracker.mark_done(offset);
        }
        tracker.try_advance_and_persist(recorder.persist()).await;

        // below the advanced window: must not resurrect block 0
        assert!(!tracker.mark_done(51));
        assert_eq!(tracker.block_starts(), vec![4]);
        // duplicate inside the live window
        assert!(!tracker.mark_done(54));
        assert!(!tracker.mark_done(54));
        assert_eq!(tracker.block(4).unwrap().marked_count(), 1);
    }

    #[tokio::test]
    async fn persist_retries_until_success() {
        let tracker = tracker(0, 2);
        let attempts = AtomicUsize::new(0);
        let successes = AtomicUsize::new(0);
        tracker.mark_done(0);
        tracker.mark_done(1);

        tracker
            .try_advance_and_persist(|_offset| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let result = if attempt < 3 {
                    Err(AppError::PersistError("store unavailable".to_string()))
                } else {
                    successes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                };
                std::future::ready(result)
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.block_starts(), vec![2]);
    }

    #[tokio::test]
    async fn persist_failure_is_not_fatal() {
        let tracker = tracker(0, 2);
        let attempts = AtomicUsize::new(0);
        tracker.mark_done(0);
        tracker.mark_done(1);
        tracker
            .try_advance_and_persist(|_offset| {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(AppError::PersistError("down".to_string())))
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), PERSIST_ATTEMPTS);
        // window still moves; the next advance persists a later offset
        assert_eq!(tracker.block_starts(), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_out_of_order_commits_are_forward_only() {
        const TOTAL: i64 = 4096;
        let tracker = Arc::new(tracker(0, 64));
        let saved = Arc::new(Mutex::new(Vec::new()));

        // 2053 is coprime with 4096, so this visits every offset once
        let order: Vec<i64> = (0..TOTAL).map(|i| (i * 2053) % TOTAL).collect();
        let mut handles = Vec::new();
        for chunk in order.chunks(256) {
            let chunk = chunk.to_vec();
            let tracker = tracker.clone();
            let saved = saved.clone();
            handles.push(tokio::spawn(async move {
                for offset in chunk {
                    if tracker.mark_done(offset) {
                        let saved = saved.clone();
                        tracker
                            .try_advance_and_persist(move |commit| {
                                saved.lock().push(commit);
                                async {
                                    tokio::task::yield_now().await;
                                    Ok(())
                                }
                            })
                            .await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let saved = saved.lock().clone();
        assert!(saved.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(saved.last().copied(), Some(TOTAL));
        assert_eq!(tracker.committed_offset(), Some(TOTAL));
    }
}
