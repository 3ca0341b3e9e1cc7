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

extern crate config as _;

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::utils::WorkerPoolConfig;

pub const DEFAULT_BLOCK_CAPACITY: usize = 1024;
/// Upper bound of a block, 16Mi slots or 2MiB of bitmap per block.
pub const MAX_BLOCK_CAPACITY: usize = 1 << 24;
const ENV_PREFIX: &str = "STONEMQ_CONSUMER";

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// Path of the json offset store; empty keeps offsets in memory.
    pub offset_store_path: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitModeKind {
    #[default]
    Interval,
    Count,
}

/// Raw per-group settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub brokers: Vec<String>,
    pub async_mode: bool,
    pub block_capacity: usize,
    pub biz_retry_times: u32,
    /// messages per second, 0 means unbounded
    pub rate_limit: u32,
    pub pool_size: Option<usize>,
    pub pool_queue_size: usize,
    pub pool_submit_timeout_ms: u64,
    pub commit_mode: CommitModeKind,
    pub commit_interval_ms: Option<u64>,
    pub commit_threshold: Option<u64>,
    pub initial_offset: InitialOffset,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            topics: Vec::new(),
            brokers: Vec::new(),
            async_mode: false,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            biz_retry_times: 0,
            rate_limit: 0,
            pool_size: None,
            pool_queue_size: 1024,
            pool_submit_timeout_ms: 500,
            commit_mode: CommitModeKind::Interval,
            commit_interval_ms: Some(1000),
            commit_threshold: None,
            initial_offset: InitialOffset::Earliest,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub general: GeneralConfig,
    pub groups: Vec<GroupConfig>,
}

impl ConsumerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ConsumerConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let consumer_config: ConsumerConfig = config.try_deserialize()?;

        Ok(consumer_config)
    }

    pub fn properties(&self) -> AppResult<Vec<ConsumerProperties>> {
        self.groups
            .iter()
            .cloned()
            .map(ConsumerProperties::try_from)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// sweep on a fixed timer
    Interval(Duration),
    /// sweep every `n` processed messages; `None` is derived at setup from the
    /// number of claimed partitions times the block capacity
    Count(Option<u64>),
}

/// Validated, immutable settings of one consumer group.
#[derive(Debug, Clone)]
pub struct ConsumerProperties {
    pub group_id: String,
    pub topics: Vec<String>,
    pub brokers: Vec<String>,
    pub async_mode: bool,
    pub block_capacity: usize,
    pub biz_retry_times: u32,
    pub rate_limit: Option<NonZeroU32>,
    pub pool: WorkerPoolConfig,
    pub commit: CommitPolicy,
    pub initial_offset: InitialOffset,
}

impl TryFrom<GroupConfig> for ConsumerProperties {
    type Error = AppError;

    fn try_from(raw: GroupConfig) -> AppResult<Self> {
        if raw.group_id.trim().is_empty() {
            return Err(AppError::ConfigError("missing group id".to_string()));
        }
        if raw.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(AppError::ConfigError(format!(
                "group {}: missing broker addresses",
                raw.group_id
            )));
        }
        if raw.topics.is_empty() {
            return Err(AppError::ConfigError(format!(
                "group {}: no topics configured",
                raw.group_id
            )));
        }
        if raw.pool_queue_size == 0 {
            return Err(AppError::ConfigError(format!(
                "group {}: pool queue size must be positive",
                raw.group_id
            )));
        }

        let commit = match raw.commit_mode {
            CommitModeKind::Interval => match raw.commit_interval_ms {
                Some(ms) if ms > 0 => CommitPolicy::Interval(Duration::from_millis(ms)),
                _ => {
                    return Err(AppError::ConfigError(format!(
                        "group {}: interval commit mode requires commit_interval_ms",
                        raw.group_id
                    )))
                }
            },
            CommitModeKind::Count => match raw.commit_threshold {
                Some(0) => {
                    return Err(AppError::ConfigError(format!(
                        "group {}: commit_threshold must be positive, omit it to derive one",
                        raw.group_id
                    )))
                }
                threshold => CommitPolicy::Count(threshold),
            },
        };

        let block_capacity = match raw.block_capacity.max(1).checked_next_power_of_two() {
            Some(capacity) if capacity <= MAX_BLOCK_CAPACITY => capacity,
            _ => {
                return Err(AppError::ConfigError(format!(
                    "group {}: block_capacity {} exceeds the maximum of {}",
                    raw.group_id, raw.block_capacity, MAX_BLOCK_CAPACITY
                )))
            }
        };

        let pool = WorkerPoolConfig {
            num_workers: raw.pool_size.unwrap_or_else(num_cpus::get).max(1),
            channel_capacity: raw.pool_queue_size,
            submit_timeout: Duration::from_millis(raw.pool_submit_timeout_ms),
            ..WorkerPoolConfig::default()
        };

        Ok(Self {
            brokers: raw
                .brokers
                .into_iter()
                .filter(|b| !b.trim().is_empty())
                .collect(),
            group_id: raw.group_id,
            topics: raw.topics,
            async_mode: raw.async_mode,
            block_capacity,
            biz_retry_times: raw.biz_retry_times,
            rate_limit: NonZeroU32::new(raw.rate_limit),
            pool,
            commit,
            initial_offset: raw.initial_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::Builder;

    use super::*;

    fn group() -> GroupConfig {
        GroupConfig {
            group_id: "billing".to_string(),
            topics: vec!["orders".to_string()],
            brokers: vec!["127.0.0.1:9092".to_string()],
            ..Default::default()
        }
    }

    #[rstest]
    #[case(1000, 1024)]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(MAX_BLOCK_CAPACITY - 1, MAX_BLOCK_CAPACITY)]
    #[case(MAX_BLOCK_CAPACITY, MAX_BLOCK_CAPACITY)]
    fn block_capacity_is_normalized(#[case] configured: usize, #[case] expected: usize) {
        let props = ConsumerProperties::try_from(GroupConfig {
            block_capacity: configured,
            ..group()
        })
        .unwrap();
        assert_eq!(props.block_capacity, expected);
    }

    #[rstest]
    #[case(MAX_BLOCK_CAPACITY + 1)]
    #[case(1 << 62)]
    #[case(usize::MAX / 2 + 2)]
    #[case(usize::MAX)]
    fn oversized_block_capacity_is_rejected(#[case] configured: usize) {
        let err = ConsumerProperties::try_from(GroupConfig {
            block_capacity: configured,
            ..group()
        })
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn missing_brokers_is_rejected() {
        let err = ConsumerProperties::try_from(GroupConfig {
            brokers: vec![" ".to_string()],
            ..group()
        })
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn interval_mode_requires_interval() {
        let err = ConsumerProperties::try_from(GroupConfig {
            commit_interval_ms: None,
            ..group()
        })
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn count_threshold_zero_is_rejected_and_none_is_derived() {
        let err = ConsumerProperties::try_from(GroupConfig {
            commit_mode: CommitModeKind::Count,
            commit_threshold: Some(0),
            ..group()
        })
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        let props = ConsumerProperties::try_from(GroupConfig {
            commit_mode: CommitModeKind::Count,
            commit_threshold: None,
            ..group()
        })
        .unwrap();
        assert_eq!(props.commit, CommitPolicy::Count(None));
    }

    #[test]
    fn zero_rate_limit_means_unbounded() {
        let props = ConsumerProperties::try_from(group()).unwrap();
        assert!(props.rate_limit.is_none());
        assert_eq!(props.initial_offset, InitialOffset::Earliest);
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[general]
offset_store_path = "/tmp/offsets.json"

[[groups]]
group_id = "billing"
topics = ["orders", "refunds"]
brokers = ["127.0.0.1:9092"]
async_mode = true
block_capacity = 64
biz_retry_times = 2
rate_limit = 500
pool_size = 8
commit_mode = "count"
commit_threshold = 256
initial_offset = "latest"
"#
        )
        .unwrap();

        let config = ConsumerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.general.offset_store_path, "/tmp/offsets.json");
        let props = config.properties().unwrap();
        assert_eq!(props.len(), 1);
        let props = &props[0];
        assert!(props.async_mode);
        assert_eq!(props.topics.len(), 2);
        assert_eq!(props.block_capacity, 64);
        assert_eq!(props.pool.num_workers, 8);
        assert_eq!(props.rate_limit.map(NonZeroU32::get), Some(500));
        assert_eq!(props.commit, CommitPolicy::Count(Some(256)));
        assert_eq!(props.initial_offset, InitialOffset::Latest);
    }
}
