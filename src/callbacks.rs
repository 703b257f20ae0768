//! A small callback registry shared by the DHT core, the agent directory,
//! and the presence service. Handlers are registered by value; a panicking
//! handler is isolated and logged rather than propagating into the
//! dispatching loop or blocking sibling handlers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::RwLock;

pub type Handler<E> = Arc<dyn Fn(E) + Send + Sync>;

pub struct CallbackRegistry<E: Clone + Send + Sync + 'static> {
    handlers: RwLock<HashMap<String, Vec<Handler<E>>>>,
}

impl<E: Clone + Send + Sync + 'static> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> CallbackRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, event: impl Into<String>, handler: Handler<E>) {
        self.handlers
            .write()
            .await
            .entry(event.into())
            .or_default()
            .push(handler);
    }

    pub async fn fire(&self, event: &str, payload: E) {
        let handlers = {
            let guard = self.handlers.read().await;
            guard.get(event).cloned().unwrap_or_default()
        };
        for handler in handlers {
            let payload = payload.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                log::error!("callback for event '{event}' panicked");
            }
        }
    }
}
