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

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::GroupSession;

/// Background task running a commit sweep on a fixed interval for one
/// generation.
#[derive(Debug)]
pub struct PeriodicCommitter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicCommitter {
    /// `sweep` is called on every tick until [`PeriodicCommitter::stop`] or
    /// until the session context is cancelled.
    pub fn start<S, Fut>(session: Arc<dyn GroupSession>, interval: Duration, sweep: S) -> Self
    where
        S: Fn(Arc<dyn GroupSession>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = session.context().child_token();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => sweep(session.clone()).await,
                }
            }
            debug!(
                "periodic committer of generation {} stopped",
                session.generation_id()
            );
        });
        Self { token, handle }
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            error!("periodic committer failed: {}", err);
        }
    }
}
