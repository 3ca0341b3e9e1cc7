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
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{offset_key, OffsetStore};
use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Json key/value file holding `offset:{group}:{topic}-{partition} -> offset`.
///
/// The whole map is rewritten on every save through a temp file and a rename,
/// so a crash never leaves a half written file behind.
#[derive(Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
    store: Mutex<HashMap<String, i64>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileOffsetStore {
    // open the store file and load it, create an empty one if it does not exist
    pub fn open(path: impl AsRef<Path>) -> AppResult<FileOffsetStore> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let store = if contents.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&contents)?
        };
        Ok(FileOffsetStore {
            path,
            store: Mutex::new(store),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.store.lock().get(key).copied()
    }

    async fn flush(&self) -> AppResult<()> {
        let _writing = self.write_lock.lock().await;
        // snapshot after taking the write lock so an older map never overwrites a newer one
        let contents = {
            let store = self.store.lock();
            serde_json::to_string_pretty(&*store)?
        };
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, contents.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn find(
        &self,
        group_id: &str,
        topic_partition: &TopicPartition,
    ) -> AppResult<Option<i64>> {
        Ok(self.get(&offset_key(group_id, topic_partition)))
    }

    async fn save(
        &self,
        group_id: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> AppResult<()> {
        let key = offset_key(group_id, topic_partition);
        trace!("store offset {} -> {}", key, offset);
        let previous = self.store.lock().insert(key.clone(), offset);
        if let Err(err) = self.flush().await {
            // the map must not report an offset the file does not hold
            let mut store = self.store.lock();
            if store.get(&key) == Some(&offset) {
                match previous {
                    Some(previous) => store.insert(key, previous),
                    None => store.remove(&key),
                };
            }
            return Err(AppError::PersistError(err.to_string()));
        }
        Ok(())
    }
}
