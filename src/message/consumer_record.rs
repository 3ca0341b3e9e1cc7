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

use bytes::Bytes;

use super::TopicPartition;

/// A record delivered by a partition claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: Vec<(String, Bytes)>,
    pub payload: Bytes,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A record stamped with the coordinator epoch it was dispatched under.
///
/// The tag never reaches the broker; it is only compared against the live
/// tracker's epoch when the handler completes.
#[derive(Debug, Clone)]
pub struct TaggedRecord {
    pub record: ConsumerRecord,
    pub epoch: u32,
}

impl TaggedRecord {
    pub fn new(record: ConsumerRecord, epoch: u32) -> Self {
        Self { record, epoch }
    }
}
