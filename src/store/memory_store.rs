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

use async_trait::async_trait;
use dashmap::DashMap;

use super::{offset_key, OffsetStore};
use crate::message::TopicPartition;
use crate::AppResult;

#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: DashMap<String, i64>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.offsets
            .get(&offset_key(group_id, topic_partition))
            .map(|offset| *offset)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn find(
        &self,
        group_id: &str,
        topic_partition: &TopicPartition,
    ) -> AppResult<Option<i64>> {
        Ok(self.get(group_id, topic_partition))
    }

    async fn save(
        &self,
        group_id: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> AppResult<()> {
        self.offsets.insert(offset_key(group_id, topic_partition), offset);
        Ok(())
    }
}
