//! Operation handler trait

use std::future::Future;

use async_trait::async_trait;
use queuestore::Task;
use serde_json::Value;
use tracing::debug;

/// Executes the actual work behind an operation name
///
/// Handlers must tolerate running more than once for the same task: a task
/// that was in flight during a stop or crash is executed again.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Run the task; an `Err` counts as a failed attempt
    async fn execute(&self, task: &Task) -> eyre::Result<Value>;
}

/// Adapts an async closure into a handler
///
/// The closure receives an owned copy of the task.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<Value>> + Send,
{
    async fn execute(&self, task: &Task) -> eyre::Result<Value> {
        debug!(task_id = %task.id, operation = %task.operation, "FnHandler::execute: called");
        (self.f)(task.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler_success() {
        let handler = FnHandler::new(|task: Task| async move { Ok(json!({ "subject": task.subject_id })) });
        let result = handler.execute(&Task::new("page-3", "ocr")).await.unwrap();
        assert_eq!(result["subject"], "page-3");
    }

    #[tokio::test]
    async fn test_fn_handler_error() {
        let handler = FnHandler::new(|_task: Task| async move { Err::<Value, _>(eyre::eyre!("scanner offline")) });
        let err = handler.execute(&Task::new("page-3", "ocr")).await.unwrap_err();
        assert_eq!(err.to_string(), "scanner offline");
    }
}
