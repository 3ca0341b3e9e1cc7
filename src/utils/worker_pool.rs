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

use std::any::type_name;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, Shutdown};

pub type PoolTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker Number
    pub num_workers: usize,
    /// Queue Capacity
    pub channel_capacity: usize,
    /// How long a submit may wait for queue space before it is rejected
    pub submit_timeout: Duration,
    /// Monitor Interval
    pub monitor_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            channel_capacity: 1024,
            submit_timeout: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// Bounded pool of workers sharing one task queue.
///
/// The pool can be released (queue closed and drained) and rebooted again,
/// which happens once per consumer generation.
pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    inner: Mutex<Option<PoolInner>>,
}

struct PoolInner {
    request_tx: async_channel::Sender<PoolTask>,
    notify_shutdown: broadcast::Sender<()>,
    monitor: JoinHandle<Vec<Worker>>,
}

/// represent a running worker
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let name = name.into();
        let inner = Self::spawn_workers_with_monitor(&name, &config);
        Self {
            name,
            config,
            inner: Mutex::new(Some(inner)),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Queues `task`, waiting up to `submit_timeout` for space.
    pub async fn submit(&self, task: PoolTask) -> AppResult<()> {
        let request_tx = self
            .inner
            .lock()
            .as_ref()
            .map(|inner| inner.request_tx.clone())
            .ok_or(AppError::PoolClosed)?;

        match time::timeout(self.config.submit_timeout, request_tx.send(task)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AppError::PoolClosed),
            Err(_) => Err(AppError::PoolSaturated(format!(
                "pool {} queue full ({}) for {:?}",
                self.name, self.config.channel_capacity, self.config.submit_timeout
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map_or(true, |inner| inner.request_tx.is_closed())
    }

    /// Number of queued tasks not yet picked up by a worker.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |inner| inner.request_tx.len())
    }

    /// Starts a fresh set of workers if the pool has been released.
    pub fn reboot(&self) {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            debug!("worker pool {} rebooting", self.name);
            *inner = Some(Self::spawn_workers_with_monitor(&self.name, &self.config));
        }
    }

    /// Closes the queue and waits until every queued task has run.
    pub async fn release(&self) {
        let Some(inner) = self.inner.lock().take() else {
            return;
        };
        // stop the monitor first so finished workers are not restarted
        let _ = inner.notify_shutdown.send(());
        let workers = match inner.monitor.await {
            Ok(workers) => workers,
            Err(err) => {
                error!("worker pool {} monitor failed: {}", self.name, err);
                Vec::new()
            }
        };
        inner.request_tx.close();
        for worker in workers {
            if let Err(err) = worker.handle.await {
                warn!("worker pool {} worker {} exited abnormally: {}", self.name, worker.id, err);
            }
        }
        debug!("worker pool {} released", self.name);
    }

    fn spawn_workers_with_monitor(name: &str, config: &WorkerPoolConfig) -> PoolInner {
        let (request_tx, request_rx) = async_channel::bounded(config.channel_capacity);
        let (notify_shutdown, _) = broadcast::channel(1);

        let workers = (0..config.num_workers)
            .map(|id| Self::spawn_worker(id, request_rx.clone()))
            .collect();
        let monitor = Self::spawn_monitor(
            name.to_string(),
            workers,
            request_rx,
            notify_shutdown.clone(),
            config.clone(),
        );

        PoolInner {
            request_tx,
            notify_shutdown,
            monitor,
        }
    }

    fn spawn_worker(id: usize, request_rx: async_channel::Receiver<PoolTask>) -> Worker {
        let handle = tokio::spawn(async move {
            trace!("Worker {} started", id);
            // exits once the queue is closed and drained
            while let Ok(task) = request_rx.recv().await {
                task.await;
            }
            trace!("Worker {} drained", id);
        });

        Worker { id, handle }
    }

    fn spawn_monitor(
        name: String,
        mut workers: Vec<Worker>,
        request_rx: async_channel::Receiver<PoolTask>,
        notify_shutdown: broadcast::Sender<()>,
        config: WorkerPoolConfig,
    ) -> JoinHandle<Vec<Worker>> {
        let mut shutdown = Shutdown::new(format!("{} monitor", name), notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            if !worker.handle.is_finished() {
                                continue;
                            }
                            match (&mut worker.handle).await {
                                Ok(()) => {
                                    warn!("Worker {} of pool {} completed unexpectedly", worker.id, name);
                                }
                                Err(err) if err.is_panic() => log_worker_panic(worker.id, err),
                                Err(err) => {
                                    error!("Worker {} failed with non-panic error: {}", worker.id, err);
                                }
                            }
                            warn!("Worker {} of pool {} failed, restarting...", worker.id, name);
                            *worker = Self::spawn_worker(worker.id, request_rx.clone());
                        }
                    }
                }
            }
            workers
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.get_mut().take() {
            inner.request_tx.close();
            let _ = inner.notify_shutdown.send(());
        }
    }
}

fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "Worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
