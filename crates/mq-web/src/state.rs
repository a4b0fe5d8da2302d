use mqd::MergeQueueEngine;
use std::sync::Arc;

/// Shared handle the axum handlers work against.
#[derive(Clone)]
pub struct WebState {
    engine: Arc<MergeQueueEngine>,
}

impl WebState {
    pub fn new(engine: Arc<MergeQueueEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &MergeQueueEngine {
        &self.engine
    }
}
