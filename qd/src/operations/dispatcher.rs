//! OperationDispatcher - maps operation names to handlers

use std::collections::HashMap;
use std::sync::Arc;

use queuestore::Task;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::builtin::{ArticleExtractor, ExtractArticlesOperation, OcrEngine, OcrOperation, PageSegmenter, SegmentOperation};
use super::handler::OperationHandler;

/// Errors raised by the dispatcher itself (not by handlers)
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// Registry of operation handlers, consulted at execution time
#[derive(Default)]
pub struct OperationDispatcher {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl OperationDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the three built-in operations wired to the given collaborators
    pub fn with_builtins(
        ocr: Arc<dyn OcrEngine>,
        segmenter: Arc<dyn PageSegmenter>,
        extractor: Arc<dyn ArticleExtractor>,
    ) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(OcrOperation::NAME, OcrOperation::new(ocr));
        dispatcher.register(SegmentOperation::NAME, SegmentOperation::new(segmenter));
        dispatcher.register(ExtractArticlesOperation::NAME, ExtractArticlesOperation::new(extractor));
        dispatcher
    }

    /// Register (or replace) the handler for an operation name
    pub fn register(&mut self, name: impl Into<String>, handler: impl OperationHandler + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        let name = name.into();
        debug!(%name, "OperationDispatcher::register: called");
        self.handlers.insert(name, handler);
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler registered for the task's operation
    pub async fn execute(&self, task: &Task) -> eyre::Result<Value> {
        debug!(task_id = %task.id, operation = %task.operation, "OperationDispatcher::execute: called");
        let handler = self
            .handlers
            .get(&task.operation)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownOperation(task.operation.clone()))?;
        handler.execute(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::FnHandler;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut dispatcher = OperationDispatcher::new();
        dispatcher.register(
            "index",
            FnHandler::new(|task: Task| async move { Ok(json!({ "indexed": task.subject_id })) }),
        );

        assert!(dispatcher.has_operation("index"));
        assert!(!dispatcher.has_operation("ocr"));

        let result = dispatcher.execute(&Task::new("doc-1", "index")).await.unwrap();
        assert_eq!(result["indexed"], "doc-1");
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let dispatcher = OperationDispatcher::new();
        let err = dispatcher.execute(&Task::new("doc-1", "teleport")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::UnknownOperation(name)) if name == "teleport"
        ));
    }

    #[test]
    fn test_operations_sorted() {
        let mut dispatcher = OperationDispatcher::new();
        for name in ["segment", "ocr", "extract_articles"] {
            dispatcher.register(name, FnHandler::new(|_t: Task| async { Ok(Value::Null) }));
        }
        assert_eq!(dispatcher.operations(), vec!["extract_articles", "ocr", "segment"]);
    }
}
