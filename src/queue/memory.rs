use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::queue::{Consumer, Producer};

/// Process-local multi-queue transport.
///
/// Queues are created on first use. One instance serves both the producer
/// and consumer side so the scheduler and an embedded worker see the same
/// buffers; `poll` drains everything queued at the time of the call.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Number of messages currently buffered on `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Producer for MemoryQueue {
    async fn send(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        debug!("Queued {} bytes on '{queue}'", payload.len());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryQueue {
    async fn poll(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let mut queues = self.queues.lock().unwrap();
        let drained = queues
            .get_mut(queue)
            .map(|buffer| buffer.drain(..).collect())
            .unwrap_or_default();
        Ok(drained)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
