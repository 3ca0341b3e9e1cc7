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

//! Durable store of one scalar offset per (group, topic-partition).

pub use file_store::FileOffsetStore;
pub use memory_store::MemoryOffsetStore;

mod file_store;
mod memory_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

pub const STORE_TIMEOUT: Duration = Duration::from_secs(3);

const OFFSET_PREFIX: &str = "offset";

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn find(&self, group_id: &str, topic_partition: &TopicPartition)
        -> AppResult<Option<i64>>;

    async fn save(
        &self,
        group_id: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> AppResult<()>;
}

pub fn offset_key(group_id: &str, topic_partition: &TopicPartition) -> String {
    format!("{}:{}:{}", OFFSET_PREFIX, group_id, topic_partition)
}

/// `save` bounded by [`STORE_TIMEOUT`]; every failure surfaces as `PersistError`.
pub async fn save_offset(
    store: &dyn OffsetStore,
    group_id: &str,
    topic_partition: &TopicPartition,
    offset: i64,
) -> AppResult<()> {
    match time::timeout(STORE_TIMEOUT, store.save(group_id, topic_partition, offset)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(AppError::PersistError(msg))) => Err(AppError::PersistError(msg)),
        Ok(Err(err)) => Err(AppError::PersistError(err.to_string())),
        Err(_) => Err(AppError::PersistError(format!(
            "save {} timed out after {:?}",
            offset_key(group_id, topic_partition),
            STORE_TIMEOUT
        ))),
    }
}

/// `find` bounded by [`STORE_TIMEOUT`].
pub async fn find_offset(
    store: &dyn OffsetStore,
    group_id: &str,
    topic_partition: &TopicPartition,
) -> AppResult<Option<i64>> {
    time::timeout(STORE_TIMEOUT, store.find(group_id, topic_partition)).await?
}
