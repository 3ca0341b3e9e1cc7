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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("operation timed out: {0}")]
    Timeout(String),

    /// fatal at coordinator construction
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    /// runtime errors, logged and survived
    #[error("persist error: {0}")]
    PersistError(String),

    #[error("business handler error: {0}")]
    BusinessError(String),

    #[error("stale generation: message epoch {stamped}, live epoch {live}")]
    StaleGeneration { stamped: u32, live: u32 },

    #[error("worker pool saturated: {0}")]
    PoolSaturated(String),

    #[error("worker pool closed")]
    PoolClosed,

    #[error("consumer lifetime cancelled")]
    Cancelled,
}

impl AppError {
    /// Errors that are part of normal rebalance/shutdown flow and should not be
    /// reported as failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, AppError::StaleGeneration { .. } | AppError::Cancelled)
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout(value.to_string())
    }
}
