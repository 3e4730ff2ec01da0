pub mod memory;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use memory::MemoryQueue;

/// Outbound side of the work queue. The scheduler sends one payload per
/// dispatched task to the queue named after the task's type; the call must
/// complete without blocking on downstream consumers.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, queue: &str, payload: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Inbound side of the status queue, polled at a fixed interval. A poll
/// drains whatever is currently queued; an empty vec means nothing arrived.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn poll(&self, queue: &str) -> Result<Vec<Vec<u8>>>;
    async fn close(&self) -> Result<()>;
}

/// Producer and consumer endpoints over one transport.
#[derive(Clone)]
pub struct QueueEndpoints {
    pub producer: Arc<dyn Producer>,
    pub consumer: Arc<dyn Consumer>,
}

/// Configuration handed to a queue factory.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Registry key selecting the transport implementation.
    pub implementation: String,
    /// Transport-specific options (broker URL, credentials, ...).
    pub options: HashMap<String, String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            implementation: "memory".to_string(),
            options: HashMap::new(),
        }
    }
}

type QueueFactory = Box<dyn Fn(&QueueSettings) -> Result<QueueEndpoints> + Send + Sync>;

/// Registration table mapping an implementation name to a factory closure.
/// Embedders register external transports at startup; the in-memory
/// transport is always available under `"memory"`.
pub struct QueueRegistry {
    factories: HashMap<String, QueueFactory>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("memory", |_settings| {
            let queue = Arc::new(MemoryQueue::new());
            Ok(QueueEndpoints {
                producer: queue.clone(),
                consumer: queue,
            })
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&QueueSettings) -> Result<QueueEndpoints> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, settings: &QueueSettings) -> Result<QueueEndpoints> {
        let factory = self.factories.get(&settings.implementation).ok_or_else(|| {
            anyhow!(
                "no queue implementation registered under '{}'",
                settings.implementation
            )
        })?;
        factory(settings)
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
