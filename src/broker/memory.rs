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
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ClientFactory, ConsumerGroupClient, ConsumerGroupHandler, GroupSession, PartitionClaim};
use crate::message::{ConsumerRecord, TopicPartition};
use crate::{AppError, AppResult, ConsumerProperties, InitialOffset};

const CLAIM_BUFFER: usize = 256;
const FETCH_BATCH: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: i64,
    records: Vec<ConsumerRecord>,
}

impl PartitionLog {
    fn log_end(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    partitions: HashMap<String, i32>,
    logs: HashMap<TopicPartition, PartitionLog>,
    committed: HashMap<(String, TopicPartition), i64>,
}

#[derive(Debug)]
struct BrokerInner {
    address: String,
    state: Mutex<BrokerState>,
    produced: Notify,
    rebalance_tx: watch::Sender<u64>,
}

/// In-process broker: partitioned logs, retention and per-group commits.
///
/// Every connected client of a group claims all partitions of its topics;
/// [`MemoryBroker::rebalance`] ends the running generation of every client.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(address: impl Into<String>) -> Self {
        let (rebalance_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                address: address.into(),
                state: Mutex::new(BrokerState::default()),
                produced: Notify::new(),
                rebalance_tx,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn create_topic(&self, topic: impl Into<String>, partitions: i32) {
        let topic = topic.into();
        let mut state = self.inner.state.lock();
        for partition in 0..partitions {
            state
                .logs
                .entry(TopicPartition::new(topic.clone(), partition))
                .or_default();
        }
        state.partitions.insert(topic, partitions);
    }

    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        headers: Vec<(String, Bytes)>,
        payload: impl Into<Bytes>,
    ) -> AppResult<i64> {
        let topic_partition = TopicPartition::new(topic, partition);
        let offset = {
            let mut state = self.inner.state.lock();
            let log = state.logs.get_mut(&topic_partition).ok_or_else(|| {
                AppError::InvalidValue(format!("unknown partition {}", topic_partition))
            })?;
            let offset = log.log_end();
            log.records.push(ConsumerRecord {
                topic: topic.to_string(),
                partition,
                offset,
                headers,
                payload: payload.into(),
            });
            offset
        };
        self.inner.produced.notify_waiters();
        Ok(offset)
    }

    /// Drops every record below `offset`, as retention would.
    pub fn truncate_before(&self, topic_partition: &TopicPartition, offset: i64) {
        let mut state = self.inner.state.lock();
        if let Some(log) = state.logs.get_mut(topic_partition) {
            let drop_count = (offset - log.log_start).clamp(0, log.records.len() as i64);
            log.records.drain(..drop_count as usize);
            log.log_start += drop_count;
        }
    }

    pub fn earliest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
        self.with_log(topic_partition, |log| log.log_start)
    }

    pub fn latest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
        self.with_log(topic_partition, PartitionLog::log_end)
    }

    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group_id.to_string(), topic_partition.clone()))
            .copied()
    }

    pub fn commit_offset(&self, group_id: &str, topic_partition: &TopicPartition, offset: i64) {
        self.inner
            .state
            .lock()
            .committed
            .insert((group_id.to_string(), topic_partition.clone()), offset);
    }

    /// Ends the current generation of every connected client.
    pub fn rebalance(&self) {
        self.inner.rebalance_tx.send_modify(|round| *round += 1);
    }

    fn partitions_of(&self, topics: &[String]) -> AppResult<Vec<TopicPartition>> {
        let state = self.inner.state.lock();
        let mut claims = Vec::new();
        for topic in topics {
            let count = state
                .partitions
                .get(topic)
                .ok_or_else(|| AppError::InvalidValue(format!("unknown topic {}", topic)))?;
            claims.extend((0..*count).map(|partition| TopicPartition::new(topic.clone(), partition)));
        }
        Ok(claims)
    }

    fn fetch(&self, topic_partition: &TopicPartition, from: i64, max: usize) -> Vec<ConsumerRecord> {
        let state = self.inner.state.lock();
        let Some(log) = state.logs.get(topic_partition) else {
            return Vec::new();
        };
        let from = from.max(log.log_start);
        let index = (from - log.log_start) as usize;
        log.records.iter().skip(index).take(max).cloned().collect()
    }

    fn with_log<R>(
        &self,
        topic_partition: &TopicPartition,
        f: impl FnOnce(&PartitionLog) -> R,
    ) -> AppResult<R> {
        self.inner
            .state
            .lock()
            .logs
            .get(topic_partition)
            .map(f)
            .ok_or_else(|| AppError::InvalidValue(format!("unknown partition {}", topic_partition)))
    }
}

#[async_trait]
impl ClientFactory for MemoryBroker {
    async fn connect(
        &self,
        props: &ConsumerProperties,
    ) -> AppResult<Arc<dyn ConsumerGroupClient>> {
        if !props.brokers.iter().any(|addr| addr == self.address()) {
            return Err(AppError::ConnectionError(format!(
                "no broker reachable at {}",
                props.brokers.join(",")
            )));
        }
        info!("group {} connected to {}", props.group_id, self.address());
        Ok(Arc::new(MemoryGroupClient {
            broker: self.clone(),
            group_id: props.group_id.clone(),
            member_id: format!("{}@{}", props.group_id, self.address()),
            initial_offset: props.initial_offset,
            generation: AtomicI32::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryGroupClient {
    broker: MemoryBroker,
    group_id: String,
    member_id: String,
    initial_offset: InitialOffset,
    generation: AtomicI32,
    closed: AtomicBool,
}

impl MemoryGroupClient {
    fn spawn_feeder(
        feeders: &mut JoinSet<()>,
        broker: MemoryBroker,
        topic_partition: TopicPartition,
        mut next: i64,
        records_tx: mpsc::Sender<ConsumerRecord>,
        token: CancellationToken,
    ) {
        feeders.spawn(async move {
            loop {
                let batch = broker.fetch(&topic_partition, next, FETCH_BATCH);
                if batch.is_empty() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = broker.inner.produced.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                    continue;
                }
                for record in batch {
                    next = record.offset + 1;
                    tokio::select! {
                        _ = token.cancelled() => return,
                        sent = records_tx.send(record) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConsumerGroupClient for MemoryGroupClient {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::ConnectionError(format!(
                "client of group {} is closed",
                self.group_id
            )));
        }
        // only rebalances requested from now on end this generation
        let mut rebalance_rx = self.broker.inner.rebalance_tx.subscribe();

        let claims = self.broker.partitions_of(topics)?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = cancel.child_token();
        let session = Arc::new(MemorySession {
            broker: self.broker.clone(),
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            generation,
            claims: claims.clone(),
            initial_offset: self.initial_offset,
            positions: Mutex::new(HashMap::new()),
            marks: Mutex::new(HashMap::new()),
            token: token.clone(),
        });
        debug!(
            "group {} generation {} claims {} partitions",
            self.group_id,
            generation,
            claims.len()
        );

        handler.setup(session.clone()).await?;

        let mut feeders = JoinSet::new();
        let mut claim_tasks = JoinSet::new();
        for topic_partition in claims {
            let start = session.start_position(&topic_partition)?;
            let (records_tx, records_rx) = mpsc::channel(CLAIM_BUFFER);
            Self::spawn_feeder(
                &mut feeders,
                self.broker.clone(),
                topic_partition.clone(),
                start,
                records_tx,
                token.clone(),
            );
            let claim = PartitionClaim::new(topic_partition, start, records_rx);
            let handler = handler.clone();
            let session: Arc<dyn GroupSession> = session.clone();
            claim_tasks.spawn(async move { handler.consume_claim(session, claim).await });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("group {} generation {} cancelled", self.group_id, generation);
            }
            _ = rebalance_rx.changed() => {
                info!("group {} generation {} rebalancing", self.group_id, generation);
            }
        }
        token.cancel();

        while let Some(joined) = claim_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_expected() => {
                    trace!("claim loop of group {} ended: {}", self.group_id, err);
                }
                Ok(Err(err)) => warn!("claim loop of group {} failed: {}", self.group_id, err),
                Err(err) => error!("claim loop of group {} panicked: {}", self.group_id, err),
            }
        }
        feeders.shutdown().await;

        handler.cleanup(session).await
    }

    async fn close(&self) -> AppResult<()> {
        self.closed.store(true, Ordering::Release);
        info!("client {} closed", self.member_id);
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySession {
    broker: MemoryBroker,
    group_id: String,
    member_id: String,
    generation: i32,
    claims: Vec<TopicPartition>,
    initial_offset: InitialOffset,
    positions: Mutex<HashMap<TopicPartition, i64>>,
    marks: Mutex<HashMap<TopicPartition, i64>>,
    token: CancellationToken,
}

impl MemorySession {
    fn start_position(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
        if let Some(position) = self.positions.lock().get(topic_partition) {
            return Ok(*position);
        }
        if let Some(committed) = self.broker.committed_offset(&self.group_id, topic_partition) {
            return Ok(committed.max(self.broker.earliest_offset(topic_partition)?));
        }
        match self.initial_offset {
            InitialOffset::Earliest => self.broker.earliest_offset(topic_partition),
            InitialOffset::Latest => self.broker.latest_offset(topic_partition),
        }
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn claims(&self) -> Vec<TopicPartition> {
        self.claims.clone()
    }

    async fn committed_offset(&self, topic_partition: &TopicPartition) -> AppResult<Option<i64>> {
        Ok(self.broker.committed_offset(&self.group_id, topic_partition))
    }

    async fn earliest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
        self.broker.earliest_offset(topic_partition)
    }

    async fn latest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64> {
        self.broker.latest_offset(topic_partition)
    }

    fn reset_offset(&self, topic_partition: &TopicPartition, offset: i64) {
        self.positions.lock().insert(topic_partition.clone(), offset);
    }

    fn mark_offset(&self, topic_partition: &TopicPartition, offset: i64) {
        let mut marks = self.marks.lock();
        let mark = marks.entry(topic_partition.clone()).or_insert(offset);
        if *mark < offset {
            *mark = offset;
        }
    }

    async fn commit(&self) -> AppResult<()> {
        let marks: Vec<_> = self
            .marks
            .lock()
            .iter()
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        for (topic_partition, offset) in marks {
            trace!("group {} commit {} at {}", self.group_id, topic_partition, offset);
            self.broker.commit_offset(&self.group_id, &topic_partition, offset);
        }
        Ok(())
    }

    fn context(&self) -> CancellationToken {
        self.token.clone()
    }
}
