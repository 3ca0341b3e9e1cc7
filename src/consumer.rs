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
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::ClientFactory;
use crate::session::{HandlerRegistry, SessionCoordinator};
use crate::store::OffsetStore;
use crate::{AppError, AppResult, ConsumerProperties};

/// Runs one [`SessionCoordinator`] per configured consumer group.
pub struct Consumer {
    coordinators: Vec<SessionCoordinator>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Consumer {
    /// Builds the coordinators. Every group gets the handlers of its own
    /// topics; a topic without a handler fails the whole construction.
    pub async fn new(
        groups: Vec<ConsumerProperties>,
        handlers: &HandlerRegistry,
        store: Arc<dyn OffsetStore>,
        factory: &dyn ClientFactory,
    ) -> AppResult<Self> {
        if groups.is_empty() {
            return Err(AppError::ConfigError("no consumer group configured".to_string()));
        }
        let mut coordinators = Vec::with_capacity(groups.len());
        for props in groups {
            let group_handlers: HandlerRegistry = handlers
                .iter()
                .filter(|(topic, _)| props.topics.contains(topic))
                .map(|(topic, handler)| (topic.clone(), handler.clone()))
                .collect::<HashMap<_, _>>();
            let coordinator =
                SessionCoordinator::new(props, &group_handlers, store.clone(), factory).await?;
            coordinators.push(coordinator);
        }
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Ok(Self {
            coordinators,
            tasks: Vec::new(),
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
        })
    }

    pub fn coordinators(&self) -> &[SessionCoordinator] {
        &self.coordinators
    }

    pub fn coordinator(&self, group_id: &str) -> Option<&SessionCoordinator> {
        self.coordinators
            .iter()
            .find(|coordinator| coordinator.group_id() == group_id)
    }

    /// Starts the claim loop of every group. Returns at once.
    pub fn consume(&mut self) -> AppResult<()> {
        let shutdown_complete_tx = self
            .shutdown_complete_tx
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("consumer already closed".to_string()))?;
        if !self.tasks.is_empty() {
            return Err(AppError::IllegalStateError(
                "consumer already started".to_string(),
            ));
        }
        for coordinator in &self.coordinators {
            let coordinator = coordinator.clone();
            let complete = shutdown_complete_tx.clone();
            self.tasks.push(tokio::spawn(async move {
                coordinator.run().await;
                drop(complete);
            }));
        }
        info!("consumer started {} groups", self.coordinators.len());
        Ok(())
    }

    /// Cancels every group, waits until all claim loops have finished their
    /// cleanup, then closes the clients.
    pub async fn close(mut self) -> AppResult<()> {
        for coordinator in &self.coordinators {
            coordinator.shutdown();
        }
        // every claim loop holds a sender; recv returns None once all are gone
        drop(self.shutdown_complete_tx.take());
        let _ = self.shutdown_complete_rx.recv().await;

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("claim loop task failed: {}", err);
            }
        }

        let mut result = Ok(());
        for coordinator in &self.coordinators {
            if let Err(err) = coordinator.close().await {
                error!("close group {} failed: {}", coordinator.group_id(), err);
                result = Err(err);
            }
        }
        info!("consumer closed");
        result
    }
}
