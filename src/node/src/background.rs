// Copyright 2024 TideKV Contributors
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

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

type BgTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A one-at-a-time background queue (snapshotting, binlog purging). The
/// consumer task is started lazily on the first schedule and runs queued
/// work strictly serially.
pub struct BgWorker {
    name: &'static str,
    tx: Mutex<Option<UnboundedSender<BgTask>>>,
}

impl BgWorker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tx: Mutex::new(None),
        }
    }

    pub fn schedule(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tx = self.tx.lock();
        let sender = tx.get_or_insert_with(|| {
            let (sender, mut rx) = unbounded_channel::<BgTask>();
            let name = self.name;
            tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    task.await;
                }
                tracing::debug!(worker = name, "background worker drained");
            });
            sender
        });
        if sender.send(Box::pin(task)).is_err() {
            tracing::warn!(worker = self.name, "task dropped, worker already closed");
        }
    }

    /// Stops accepting work; the consumer exits after draining its queue.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[tokio::test]
    async fn test_tasks_run_serially_in_order() {
        let worker = Arc::new(BgWorker::new("test"));
        let (tx, mut rx) = unbounded_channel();

        for i in 0..10 {
            let tx = tx.clone();
            worker.schedule(async move {
                // Yield to give later tasks a chance to overtake if the
                // queue were ever drained concurrently.
                tokio::task::yield_now().await;
                tx.send(i).unwrap();
            });
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_schedule_after_close_is_dropped() {
        let worker = BgWorker::new("test");
        worker.close();
        worker.schedule(async {});
    }
}
