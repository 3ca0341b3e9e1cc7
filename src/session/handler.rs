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
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::message::ConsumerRecord;
use crate::AppResult;

/// Business logic for the records of one topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, record: &ConsumerRecord) -> AppResult<()>;
}

/// topic -> handler, resolved once when a coordinator is built
pub type HandlerRegistry = HashMap<String, Arc<dyn MessageHandler>>;

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    async fn handle(&self, record: &ConsumerRecord) -> AppResult<()> {
        (self.f)(record.clone()).await
    }
}

/// Outcome of running a record through its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Handled { attempts: u32 },
    /// every attempt failed; the record is skipped
    Abandoned { attempts: u32 },
}

/// Runs `handler` up to `retry_times + 1` times, stopping at the first
/// success. Failures are logged, never returned.
pub async fn handle_with_retry(
    handler: &dyn MessageHandler,
    record: &ConsumerRecord,
    retry_times: u32,
) -> HandleOutcome {
    let max_attempts = retry_times.saturating_add(1);
    for attempt in 1..=max_attempts {
        match handler.handle(record).await {
            Ok(()) => return HandleOutcome::Handled { attempts: attempt },
            Err(err) => warn!(
                "handle {}-{}@{} failed (attempt {}/{}): {}",
                record.topic, record.partition, record.offset, attempt, max_attempts, err
            ),
        }
    }
    error!(
        "abandon {}-{}@{} after {} attempts",
        record.topic, record.partition, record.offset, max_attempts
    );
    HandleOutcome::Abandoned {
        attempts: max_attempts,
    }
}
