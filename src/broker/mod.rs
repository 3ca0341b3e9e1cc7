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

//! Contract between the session coordinator and the broker client.
//!
//! The client owns group membership: every call to
//! [`ConsumerGroupClient::consume`] joins the group, runs one generation and
//! returns once that generation ends (rebalance or cancellation). Within a
//! generation the client calls [`ConsumerGroupHandler::setup`] once,
//! [`ConsumerGroupHandler::consume_claim`] once per claimed partition in its
//! own task, and [`ConsumerGroupHandler::cleanup`] after every claim loop has
//! returned.

pub use memory::{MemoryBroker, MemoryGroupClient};

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{ConsumerRecord, TopicPartition};
use crate::{AppResult, ConsumerProperties};

/// Records of one partition for one generation, delivered in log order.
#[derive(Debug)]
pub struct PartitionClaim {
    topic_partition: TopicPartition,
    initial_offset: i64,
    records: mpsc::Receiver<ConsumerRecord>,
}

impl PartitionClaim {
    pub fn new(
        topic_partition: TopicPartition,
        initial_offset: i64,
        records: mpsc::Receiver<ConsumerRecord>,
    ) -> Self {
        Self {
            topic_partition,
            initial_offset,
            records,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Next record, `None` once the claim has been closed by the client.
    pub async fn recv(&mut self) -> Option<ConsumerRecord> {
        self.records.recv().await
    }
}

#[async_trait]
pub trait GroupSession: Send + Sync {
    fn group_id(&self) -> &str;

    fn member_id(&self) -> &str;

    fn generation_id(&self) -> i32;

    fn claims(&self) -> Vec<TopicPartition>;

    /// Offset committed on the broker for this group, if any.
    async fn committed_offset(&self, topic_partition: &TopicPartition) -> AppResult<Option<i64>>;

    /// First offset still retained by the broker.
    async fn earliest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64>;

    /// Offset the next produced record will get.
    async fn latest_offset(&self, topic_partition: &TopicPartition) -> AppResult<i64>;

    /// Moves the delivery position of a claim before it starts; only
    /// meaningful during setup.
    fn reset_offset(&self, topic_partition: &TopicPartition, offset: i64);

    /// Records `offset` as the candidate checkpoint; never moves backwards.
    fn mark_offset(&self, topic_partition: &TopicPartition, offset: i64);

    /// Commits every marked checkpoint.
    async fn commit(&self) -> AppResult<()>;

    /// Cancelled when the generation ends.
    fn context(&self) -> CancellationToken;
}

#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> AppResult<()>;

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> AppResult<()>;

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> AppResult<()>;
}

#[async_trait]
pub trait ConsumerGroupClient: Send + Sync {
    /// Runs one generation of the group over `topics`.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancellationToken,
    ) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Dials the brokers and joins nothing yet; fails with `ConnectionError`.
    async fn connect(&self, props: &ConsumerProperties)
        -> AppResult<Arc<dyn ConsumerGroupClient>>;
}
