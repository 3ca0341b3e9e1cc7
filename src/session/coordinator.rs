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

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::commit::PeriodicCommitter;
use super::handler::{handle_with_retry, HandleOutcome, HandlerRegistry, MessageHandler};
use crate::broker::{
    ClientFactory, ConsumerGroupClient, ConsumerGroupHandler, GroupSession, PartitionClaim,
};
use crate::message::{TaggedRecord, TopicPartition};
use crate::offset::PartitionOffsetTracker;
use crate::store::{find_offset, save_offset, OffsetStore};
use crate::utils::{IntakeRateLimiter, PoolTask, WorkerPool};
use crate::{AppError, AppResult, CommitPolicy, ConsumerProperties, InitialOffset};

/// Pause before joining the group again after a failed generation.
pub const CLAIM_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Assigned,
    Draining,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Assigned => write!(f, "assigned"),
            SessionState::Draining => write!(f, "draining"),
        }
    }
}

/// Drives the offset trackers of one consumer group through its generations.
///
/// One coordinator lives for the whole process. Its trackers and epoch are
/// generation scoped: setup creates a tracker per claimed partition, cleanup
/// salvages and discards them and bumps the epoch so that completions still
/// in flight from the old generation are dropped.
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<Shared>,
}

struct Shared {
    props: ConsumerProperties,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    store: Arc<dyn OffsetStore>,
    client: Arc<dyn ConsumerGroupClient>,
    pool: Option<WorkerPool>,
    limiter: IntakeRateLimiter,
    lifetime: CancellationToken,
    trackers: DashMap<TopicPartition, Arc<PartitionOffsetTracker>>,
    epoch: AtomicU32,
    processed: AtomicU64,
    /// 0 when commits are interval based
    commit_threshold: AtomicU64,
    state: Mutex<SessionState>,
    committer: Mutex<Option<PeriodicCommitter>>,
}

impl SessionCoordinator {
    pub async fn new(
        props: ConsumerProperties,
        handlers: &HandlerRegistry,
        store: Arc<dyn OffsetStore>,
        factory: &dyn ClientFactory,
    ) -> AppResult<Self> {
        let mut resolved = HashMap::with_capacity(props.topics.len());
        for topic in &props.topics {
            let handler = handlers.get(topic).ok_or_else(|| {
                AppError::ConfigError(format!(
                    "group {}: no handler registered for topic {}",
                    props.group_id, topic
                ))
            })?;
            resolved.insert(topic.clone(), handler.clone());
        }

        let client = factory.connect(&props).await?;

        let pool = props
            .async_mode
            .then(|| WorkerPool::new(format!("{}-pool", props.group_id), props.pool.clone()));
        let commit_threshold = match props.commit {
            CommitPolicy::Count(Some(threshold)) => threshold,
            _ => 0,
        };
        info!(
            "coordinator of group {} created: topics {:?}, async {}, block capacity {}, commit {:?}",
            props.group_id, props.topics, props.async_mode, props.block_capacity, props.commit
        );

        Ok(Self {
            shared: Arc::new(Shared {
                limiter: IntakeRateLimiter::new(props.rate_limit),
                props,
                handlers: resolved,
                store,
                client,
                pool,
                lifetime: CancellationToken::new(),
                trackers: DashMap::new(),
                epoch: AtomicU32::new(0),
                processed: AtomicU64::new(0),
                commit_threshold: AtomicU64::new(commit_threshold),
                state: Mutex::new(SessionState::Idle),
                committer: Mutex::new(None),
            }),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.shared.props.group_id
    }

    pub fn properties(&self) -> &ConsumerProperties {
        &self.shared.props
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn epoch(&self) -> u32 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    /// Messages completed in the current generation.
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Acquire)
    }

    pub fn commit_threshold(&self) -> Option<u64> {
        match self.shared.commit_threshold.load(Ordering::Acquire) {
            0 => None,
            threshold => Some(threshold),
        }
    }

    pub fn tracker(&self, topic_partition: &TopicPartition) -> Option<Arc<PartitionOffsetTracker>> {
        self.shared
            .trackers
            .get(topic_partition)
            .map(|tracker| tracker.value().clone())
    }

    /// Cancels the lifetime context; the running generation still cleans up.
    pub fn shutdown(&self) {
        self.shared.lifetime.cancel();
    }

    /// Joins the group generation after generation until the lifetime
    /// context is cancelled.
    pub async fn run(&self) {
        let shared = &self.shared;
        let handler: Arc<dyn ConsumerGroupHandler> = Arc::new(self.clone());
        info!(
            "claim loop of group {} started on {:?}",
            shared.props.group_id, shared.props.topics
        );
        while !shared.lifetime.is_cancelled() {
            let result = shared
                .client
                .consume(&shared.props.topics, handler.clone(), shared.lifetime.clone())
                .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_expected() => {}
                Err(err) => {
                    warn!(
                        "group {} consume failed, retry in {:?}: {}",
                        shared.props.group_id, CLAIM_RETRY_BACKOFF, err
                    );
                    tokio::select! {
                        _ = shared.lifetime.cancelled() => break,
                        _ = tokio::time::sleep(CLAIM_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
        info!("claim loop of group {} exited", shared.props.group_id);
    }

    /// Closes the broker client and drains the worker pool.
    pub async fn close(&self) -> AppResult<()> {
        self.shared.lifetime.cancel();
        if let Some(pool) = &self.shared.pool {
            pool.release().await;
        }
        self.shared.client.close().await
    }

    /// Marks a finished record in its tracker. Fails with `StaleGeneration`
    /// when the record was dispatched under another epoch.
    pub async fn complete(
        &self,
        session: &Arc<dyn GroupSession>,
        tagged: &TaggedRecord,
    ) -> AppResult<()> {
        self.shared.complete(session, tagged).await
    }

    pub async fn commit_sweep(&self, session: &dyn GroupSession) {
        self.shared.commit_sweep(session).await
    }
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        debug!("group {} session {} -> {}", self.props.group_id, *state, next);
        *state = next;
    }

    /// `max(committed, persisted, earliest)`; the initial offset policy only
    /// applies when neither the broker nor the store knows the partition.
    async fn seed_offset(
        &self,
        session: &dyn GroupSession,
        topic_partition: &TopicPartition,
    ) -> AppResult<i64> {
        let committed = session.committed_offset(topic_partition).await?;
        let persisted =
            match find_offset(self.store.as_ref(), &self.props.group_id, topic_partition).await {
                Ok(persisted) => persisted,
                Err(err) => {
                    warn!(
                        "group {} {} offset lookup failed, using broker offsets: {}",
                        self.props.group_id, topic_partition, err
                    );
                    None
                }
            };
        let earliest = session.earliest_offset(topic_partition).await?;

        let seed = match committed.into_iter().chain(persisted).max() {
            Some(known) => known,
            None => match self.props.initial_offset {
                InitialOffset::Earliest => earliest,
                InitialOffset::Latest => session.latest_offset(topic_partition).await?,
            },
        };
        Ok(seed.max(earliest))
    }

    async fn seed_trackers(
        &self,
        session: &dyn GroupSession,
        claims: &[TopicPartition],
        epoch: u32,
    ) -> AppResult<()> {
        for topic_partition in claims {
            let seed = self.seed_offset(session, topic_partition).await?;
            session.reset_offset(topic_partition, seed);
            let tracker = Arc::new(PartitionOffsetTracker::new(
                self.props.group_id.clone(),
                topic_partition.clone(),
                seed,
                self.props.block_capacity,
                epoch,
            ));
            if self
                .trackers
                .insert(topic_partition.clone(), tracker)
                .is_some()
            {
                debug!("replaced tracker of {}", topic_partition);
            }
            debug!(
                "group {} epoch {} tracks {} from offset {}",
                self.props.group_id, epoch, topic_partition, seed
            );
        }
        Ok(())
    }

    async fn process(&self, session: &Arc<dyn GroupSession>, tagged: TaggedRecord) {
        let record = &tagged.record;
        match self.handlers.get(&record.topic) {
            Some(handler) => {
                let outcome =
                    handle_with_retry(handler.as_ref(), record, self.props.biz_retry_times).await;
                if let HandleOutcome::Handled { attempts } = outcome {
                    trace!(
                        "handled {}-{}@{} in {} attempts",
                        record.topic,
                        record.partition,
                        record.offset,
                        attempts
                    );
                }
            }
            None => warn!(
                "group {} has no handler for topic {}, skip offset {}",
                self.props.group_id, record.topic, record.offset
            ),
        }

        if let Err(err) = self.complete(session, &tagged).await {
            debug!(
                "discard completion of {}-{}@{}: {}",
                record.topic, record.partition, record.offset, err
            );
        }
    }

    async fn complete(
        &self,
        session: &Arc<dyn GroupSession>,
        tagged: &TaggedRecord,
    ) -> AppResult<()> {
        let topic_partition = tagged.record.topic_partition();
        let tracker = self
            .trackers
            .get(&topic_partition)
            .map(|tracker| tracker.value().clone())
            .ok_or_else(|| AppError::StaleGeneration {
                stamped: tagged.epoch,
                live: self.epoch.load(Ordering::Acquire),
            })?;
        if tracker.epoch() != tagged.epoch {
            return Err(AppError::StaleGeneration {
                stamped: tagged.epoch,
                live: tracker.epoch(),
            });
        }

        if tracker.mark_done(tagged.record.offset) {
            let (store, group_id, topic_partition) =
                (self.store.as_ref(), self.props.group_id.as_str(), &topic_partition);
            tracker
                .try_advance_and_persist(move |offset| {
                    save_offset(store, group_id, topic_partition, offset)
                })
                .await;
        }

        let processed = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.commit_threshold.load(Ordering::Acquire);
        if threshold > 0 && processed % threshold == 0 {
            self.commit_sweep(session.as_ref()).await;
        }
        Ok(())
    }

    async fn commit_sweep(&self, session: &dyn GroupSession) {
        let marks: Vec<(TopicPartition, i64)> = self
            .trackers
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .committed_offset()
                    .map(|offset| (entry.key().clone(), offset))
            })
            .collect();
        for (topic_partition, offset) in &marks {
            session.mark_offset(topic_partition, *offset);
        }
        match session.commit().await {
            Ok(()) => trace!(
                "group {} committed {} partitions",
                self.props.group_id,
                marks.len()
            ),
            Err(err) => warn!("group {} commit failed: {}", self.props.group_id, err),
        }
    }
}

#[async_trait]
impl ConsumerGroupHandler for SessionCoordinator {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> AppResult<()> {
        let shared = &self.shared;
        shared.set_state(SessionState::Assigned);
        shared.processed.store(0, Ordering::Release);

        let epoch = shared.epoch.load(Ordering::Acquire);
        let claims = session.claims();
        let block_capacity = shared.props.block_capacity;
        shared
            .trackers
            .retain(|topic_partition, _| claims.contains(topic_partition));

        if let Err(err) = shared.seed_trackers(session.as_ref(), &claims, epoch).await {
            // the client skips cleanup when setup fails
            shared.trackers.clear();
            shared.set_state(SessionState::Idle);
            warn!(
                "group {} generation {} setup failed: {}",
                shared.props.group_id,
                session.generation_id(),
                err
            );
            return Err(err);
        }

        if let Some(pool) = &shared.pool {
            if pool.is_closed() {
                pool.reboot();
            }
        }

        match shared.props.commit {
            CommitPolicy::Count(threshold) => {
                let threshold = threshold
                    .unwrap_or((claims.len() as u64).saturating_mul(block_capacity as u64))
                    .max(1);
                shared.commit_threshold.store(threshold, Ordering::Release);
            }
            CommitPolicy::Interval(interval) => {
                let sweeper = self.shared.clone();
                let committer = PeriodicCommitter::start(session.clone(), interval, move |session| {
                    let sweeper = sweeper.clone();
                    async move { sweeper.commit_sweep(session.as_ref()).await }
                });
                let previous = shared.committer.lock().replace(committer);
                if let Some(previous) = previous {
                    previous.stop().await;
                }
            }
        }

        info!(
            "group {} generation {} set up: {} partitions, epoch {}",
            shared.props.group_id,
            session.generation_id(),
            claims.len(),
            epoch
        );
        Ok(())
    }

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> AppResult<()> {
        let shared = &self.shared;
        shared.set_state(SessionState::Draining);

        // let queued work of this generation land in its trackers first
        if let Some(pool) = &shared.pool {
            pool.release().await;
        }
        let committer = shared.committer.lock().take();
        if let Some(committer) = committer {
            committer.stop().await;
        }

        let trackers: Vec<_> = shared
            .trackers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let (store, group_id) = (shared.store.as_ref(), shared.props.group_id.as_str());
        for (topic_partition, tracker) in trackers {
            let partition = &topic_partition;
            let offset = tracker
                .persist_final_on_shutdown(move |offset| {
                    save_offset(store, group_id, partition, offset)
                })
                .await;
            session.mark_offset(&topic_partition, offset);
            shared
                .trackers
                .remove_if(&topic_partition, |_, current| Arc::ptr_eq(current, &tracker));
            debug!(
                "group {} salvaged {} at offset {}",
                shared.props.group_id, topic_partition, offset
            );
        }
        if let Err(err) = session.commit().await {
            warn!(
                "group {} final commit failed: {}",
                shared.props.group_id, err
            );
        }

        let next_epoch = shared.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        info!(
            "group {} generation {} cleaned up: {} messages processed, next epoch {}",
            shared.props.group_id,
            session.generation_id(),
            shared.processed.load(Ordering::Acquire),
            next_epoch
        );
        shared.set_state(SessionState::Idle);
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: PartitionClaim,
    ) -> AppResult<()> {
        let shared = &self.shared;
        let context = session.context();
        debug!(
            "group {} claim {} from offset {}",
            shared.props.group_id,
            claim.topic_partition(),
            claim.initial_offset()
        );

        loop {
            let record = tokio::select! {
                biased;
                _ = context.cancelled() => break,
                record = claim.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            if !shared.limiter.wait(&context).await {
                break;
            }

            let tagged = TaggedRecord::new(record, shared.epoch.load(Ordering::Acquire));
            match &shared.pool {
                Some(pool) => {
                    let offset = tagged.record.offset;
                    let task_shared = shared.clone();
                    let task_session = session.clone();
                    let task: PoolTask = Box::pin(async move {
                        task_shared.process(&task_session, tagged).await;
                    });
                    if let Err(err) = pool.submit(task).await {
                        // left unmarked, redelivered from the last checkpoint
                        warn!(
                            "group {} drop {}@{}: {}",
                            shared.props.group_id,
                            claim.topic_partition(),
                            offset,
                            err
                        );
                    }
                }
                None => shared.process(&session, tagged).await,
            }
        }

        if shared.lifetime.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::message::ConsumerRecord;
    use crate::service::setup_local_tracing;
    use crate::session::FnHandler;
    use crate::store::MemoryOffsetStore;
    use crate::{CommitModeKind, GroupConfig};

    const BROKER: &str = "memory:9092";

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    struct TestSession {
        claims: Vec<TopicPartition>,
        committed: Option<i64>,
        earliest: i64,
        latest: i64,
        /// partition whose offset lookup fails
        unavailable: Option<TopicPartition>,
        resets: Mutex<HashMap<TopicPartition, i64>>,
        marks: Mutex<HashMap<TopicPartition, i64>>,
        commits: AtomicUsize,
        token: CancellationToken,
    }

    impl TestSession {
        fn new(claims: Vec<TopicPartition>) -> Self {
            Self {
                claims,
                committed: None,
                earliest: 0,
                latest: 0,
                unavailable: None,
                resets: Mutex::new(HashMap::new()),
                marks: Mutex::new(HashMap::new()),
                commits: AtomicUsize::new(0),
                token: CancellationToken::new(),
            }
        }

        fn mark(&self, topic_partition: &TopicPartition) -> Option<i64> {
            self.marks.lock().get(topic_partition).copied()
        }
    }

    #[async_trait]
    impl GroupSession for TestSession {
        fn group_id(&self) -> &str {
            "billing"
        }

        fn member_id(&self) -> &str {
            "billing-test"
        }

        fn generation_id(&self) -> i32 {
            1
        }

        fn claims(&self) -> Vec<TopicPartition> {
            self.claims.clone()
        }

        async fn committed_offset(&self, _: &TopicPartition) -> AppResult<Option<i64>> {
            Ok(self.committed)
        }

        async fn earliest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
            if self.unavailable.as_ref() == Some(topic_partition) {
                return Err(AppError::ConnectionError(format!(
                    "leader of {} unavailable",
                    topic_partition
                )));
            }
            Ok(self.earliest)
        }

        async fn latest_offset(&self, _: &TopicPartition) -> AppResult<i64> {
            Ok(self.latest)
        }

        fn reset_offset(&self, topic_partition: &TopicPartition, offset: i64) {
            self.resets.lock().insert(topic_partition.clone(), offset);
        }

        fn mark_offset(&self, topic_partition: &TopicPartition, offset: i64) {
            let mut marks = self.marks.lock();
            let mark = marks.entry(topic_partition.clone()).or_insert(offset);
            *mark = (*mark).max(offset);
        }

        async fn commit(&self) -> AppResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn context(&self) -> CancellationToken {
            self.token.clone()
        }
    }

    fn orders(partition: i32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".to_string(),
            partition,
            offset,
            headers: Vec::new(),
            payload: Bytes::from_static(b"order"),
        }
    }

    fn handlers() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.insert(
            "orders".to_string(),
            Arc::new(FnHandler::new(|_record: ConsumerRecord| async { Ok(()) })),
        );
        handlers
    }

    async fn coordinator(config: GroupConfig, store: Arc<MemoryOffsetStore>) -> SessionCoordinator {
        coordinator_with(config, store, &handlers()).await
    }

    async fn coordinator_with(
        config: GroupConfig,
        store: Arc<MemoryOffsetStore>,
        handlers: &HandlerRegistry,
    ) -> SessionCoordinator {
        let broker = MemoryBroker::new(BROKER);
        let props = ConsumerProperties::try_from(GroupConfig {
            group_id: "billing".to_string(),
            topics: vec!["orders".to_string()],
            brokers: vec![BROKER.to_string()],
            ..config
        })
        .unwrap();
        SessionCoordinator::new(props, handlers, store, &broker)
            .await
            .unwrap()
    }

    fn count_mode(threshold: Option<u64>) -> GroupConfig {
        GroupConfig {
            block_capacity: 16,
            commit_mode: CommitModeKind::Count,
            commit_threshold: threshold,
            ..Default::default()
        }
    }

    #[rstest]
    #[tokio::test]
    async fn missing_handler_is_a_config_error(_setup: ()) {
        let broker = MemoryBroker::new(BROKER);
        let props = ConsumerProperties::try_from(GroupConfig {
            group_id: "billing".to_string(),
            topics: vec!["orders".to_string(), "refunds".to_string()],
            brokers: vec![BROKER.to_string()],
            ..Default::default()
        })
        .unwrap();
        let result = SessionCoordinator::new(
            props,
            &handlers(),
            Arc::new(MemoryOffsetStore::new()),
            &broker,
        )
        .await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn setup_seeds_from_highest_known_offset(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        store.save("billing", &orders(0), 25).await.unwrap();
        let coordinator = coordinator(count_mode(None), store).await;

        let session = Arc::new(TestSession {
            committed: Some(10),
            earliest: 5,
            ..TestSession::new(vec![orders(0), orders(1)])
        });
        coordinator.setup(session.clone()).await.unwrap();

        assert_eq!(coordinator.state(), SessionState::Assigned);
        // persisted offset wins on partition 0, broker commit on partition 1
        assert_eq!(coordinator.tracker(&orders(0)).unwrap().start_offset(), 25);
        assert_eq!(coordinator.tracker(&orders(1)).unwrap().start_offset(), 10);
        assert_eq!(session.resets.lock().get(&orders(0)), Some(&25));
        // derived threshold: 2 partitions x 16 slots
        assert_eq!(coordinator.commit_threshold(), Some(32));
    }

    #[rstest]
    #[tokio::test]
    async fn retention_and_policy_bound_the_seed(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        store.save("billing", &orders(0), 3).await.unwrap();
        let coordinator = coordinator(
            GroupConfig {
                initial_offset: InitialOffset::Latest,
                ..count_mode(Some(8))
            },
            store,
        )
        .await;

        let session = Arc::new(TestSession {
            earliest: 40,
            latest: 90,
            ..TestSession::new(vec![orders(0), orders(1)])
        });
        coordinator.setup(session.clone()).await.unwrap();

        // persisted offset already deleted by retention
        assert_eq!(coordinator.tracker(&orders(0)).unwrap().start_offset(), 40);
        // nothing known: initial offset policy
        assert_eq!(coordinator.tracker(&orders(1)).unwrap().start_offset(), 90);
        assert_eq!(coordinator.commit_threshold(), Some(8));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_setup_leaves_coordinator_idle(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator(count_mode(None), store).await;

        let session = Arc::new(TestSession {
            unavailable: Some(orders(1)),
            ..TestSession::new(vec![orders(0), orders(1), orders(2)])
        });
        let result = coordinator.setup(session.clone()).await;
        assert!(matches!(result, Err(AppError::ConnectionError(_))));

        assert_eq!(coordinator.state(), SessionState::Idle);
        assert_eq!(coordinator.epoch(), 0);
        // partition 0 was seeded before the failure and must not linger
        assert!(coordinator.tracker(&orders(0)).is_none());
        assert!(coordinator.tracker(&orders(1)).is_none());

        // the next generation starts clean
        let session = Arc::new(TestSession::new(vec![orders(0)]));
        coordinator.setup(session).await.unwrap();
        assert_eq!(coordinator.state(), SessionState::Assigned);
        assert_eq!(coordinator.tracker(&orders(0)).unwrap().start_offset(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn stale_completion_does_not_touch_new_generation(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator(count_mode(Some(1000)), store.clone()).await;
        let session: Arc<dyn GroupSession> = Arc::new(TestSession::new(vec![orders(0)]));

        coordinator.setup(session.clone()).await.unwrap();
        assert_eq!(coordinator.epoch(), 0);
        coordinator
            .complete(&session, &TaggedRecord::new(record(0, 5), 0))
            .await
            .unwrap();
        assert!(coordinator
            .tracker(&orders(0))
            .unwrap()
            .block(0)
            .unwrap()
            .is_marked(5));

        // rebalance
        coordinator.cleanup(session.clone()).await.unwrap();
        assert_eq!(coordinator.epoch(), 1);
        assert_eq!(coordinator.state(), SessionState::Idle);
        assert!(coordinator.tracker(&orders(0)).is_none());
        coordinator.setup(session.clone()).await.unwrap();

        let late = coordinator
            .complete(&session, &TaggedRecord::new(record(0, 6), 0))
            .await;
        assert!(matches!(
            late,
            Err(AppError::StaleGeneration {
                stamped: 0,
                live: 1
            })
        ));
        let tracker = coordinator.tracker(&orders(0)).unwrap();
        assert_eq!(tracker.epoch(), 1);
        assert_eq!(tracker.block_starts(), vec![0]);
        assert_eq!(tracker.block(0).unwrap().marked_count(), 0);
        assert_eq!(coordinator.processed(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn cleanup_salvages_contiguous_prefix(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator(count_mode(Some(1000)), store.clone()).await;
        let test_session = Arc::new(TestSession {
            committed: Some(100),
            ..TestSession::new(vec![orders(0)])
        });
        let session: Arc<dyn GroupSession> = test_session.clone();
        coordinator.setup(session.clone()).await.unwrap();

        // 100..=119 with a gap at 117
        for offset in (100..120).filter(|offset| *offset != 117) {
            coordinator
                .complete(&session, &TaggedRecord::new(record(0, offset), 0))
                .await
                .unwrap();
        }
        // first block of 16 advanced and persisted
        assert_eq!(store.get("billing", &orders(0)), Some(116));

        coordinator.cleanup(session.clone()).await.unwrap();
        assert_eq!(store.get("billing", &orders(0)), Some(117));
        assert_eq!(test_session.mark(&orders(0)), Some(117));
        assert!(test_session.commits.load(Ordering::SeqCst) >= 1);
    }

    #[rstest]
    #[tokio::test]
    async fn count_threshold_triggers_commit_sweep(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator(count_mode(Some(4)), store).await;
        let test_session = Arc::new(TestSession::new(vec![orders(0)]));
        let session: Arc<dyn GroupSession> = test_session.clone();
        coordinator.setup(session.clone()).await.unwrap();

        for offset in 0..3 {
            coordinator
                .complete(&session, &TaggedRecord::new(record(0, offset), 0))
                .await
                .unwrap();
        }
        assert_eq!(test_session.commits.load(Ordering::SeqCst), 0);

        coordinator
            .complete(&session, &TaggedRecord::new(record(0, 3), 0))
            .await
            .unwrap();
        assert_eq!(test_session.commits.load(Ordering::SeqCst), 1);
        // head block not full yet: the sweep reports the trailing edge
        assert_eq!(test_session.mark(&orders(0)), Some(0));
    }

    #[rstest]
    #[tokio::test]
    async fn interval_mode_commits_periodically(_setup: ()) {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator(
            GroupConfig {
                block_capacity: 4,
                commit_interval_ms: Some(20),
                ..Default::default()
            },
            store,
        )
        .await;
        let test_session = Arc::new(TestSession::new(vec![orders(0)]));
        let session: Arc<dyn GroupSession> = test_session.clone();
        coordinator.setup(session.clone()).await.unwrap();
        assert_eq!(coordinator.commit_threshold(), None);

        for offset in 0..6 {
            coordinator
                .complete(&session, &TaggedRecord::new(record(0, offset), 0))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(test_session.commits.load(Ordering::SeqCst) >= 2);
        assert_eq!(test_session.mark(&orders(0)), Some(4));

        coordinator.cleanup(session.clone()).await.unwrap();
        let commits = test_session.commits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        // committer stopped with the generation
        assert_eq!(test_session.commits.load(Ordering::SeqCst), commits);
        assert_eq!(test_session.mark(&orders(0)), Some(6));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saturated_pool_drops_without_marking(_setup: ()) {
        let mut slow = HandlerRegistry::new();
        slow.insert(
            "orders".to_string(),
            Arc::new(FnHandler::new(|_record: ConsumerRecord| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })),
        );
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = coordinator_with(
            GroupConfig {
                async_mode: true,
                pool_size: Some(1),
                pool_queue_size: 1,
                pool_submit_timeout_ms: 50,
                ..count_mode(Some(1000))
            },
            store.clone(),
            &slow,
        )
        .await;
        let session: Arc<dyn GroupSession> = Arc::new(TestSession::new(vec![orders(0)]));
        coordinator.setup(session.clone()).await.unwrap();

        let (records_tx, records_rx) = tokio::sync::mpsc::channel(8);
        for offset in 0..5 {
            records_tx.send(record(0, offset)).await.unwrap();
        }
        drop(records_tx);
        let claim = PartitionClaim::new(orders(0), 0, records_rx);
        coordinator
            .consume_claim(session.clone(), claim)
            .await
            .unwrap();

        // one running, one queued, the rest rejected
        coordinator.cleanup(session.clone()).await.unwrap();
        assert_eq!(store.get("billing", &orders(0)), Some(2));
    }
}
