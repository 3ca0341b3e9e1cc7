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

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio_util::sync::CancellationToken;

/// Per-coordinator intake limiter: every delivered message waits for a token
/// before it is dispatched.
#[derive(Clone)]
pub struct IntakeRateLimiter {
    limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, clock::DefaultClock>>>,
}

impl IntakeRateLimiter {
    /// `None` disables limiting.
    pub fn new(per_second: Option<NonZeroU32>) -> Self {
        Self {
            limiter: per_second.map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate)))),
        }
    }

    pub fn unbounded() -> Self {
        Self { limiter: None }
    }

    /// Waits for a token. Returns false when `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(limiter) = &self.limiter else {
            return true;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = limiter.until_ready() => true,
        }
    }
}
