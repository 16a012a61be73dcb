use async_trait::async_trait;
use colony_core::{ColonyResult, Task};
use std::future::Future;

/// Executes the work described by a [`Task`].
///
/// Errors are recorded on the task and reported as `task_error` signals; they
/// never take the executing agent down.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, agent_id: &str, task: &Task) -> ColonyResult<serde_json::Value>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = ColonyResult<serde_json::Value>> + Send,
{
    async fn handle(&self, _agent_id: &str, task: &Task) -> ColonyResult<serde_json::Value> {
        (self.f)(task.clone()).await
    }
}

/// Echoes the task content back as its result.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, agent_id: &str, task: &Task) -> ColonyResult<serde_json::Value> {
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "task": task.name,
            "content": task.content,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use colony_core::{ColonyError, TaskOptions};

    fn task(name: &str) -> Task {
        Task::new(name, serde_json::json!(1), TaskOptions::new(), 0, 1000)
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let h = FnHandler::new(|t: Task| async move {
            if t.name == "bad" {
                Err(ColonyError::Execution("refused".into()))
            } else {
                Ok(serde_json::json!(t.name))
            }
        });
        assert_eq!(h.handle("a", &task("ok")).await.unwrap(), "ok");
        assert!(h.handle("a", &task("bad")).await.is_err());
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let out = EchoHandler.handle("agent-0001", &task("ping")).await.unwrap();
        assert_eq!(out["agent_id"], "agent-0001");
        assert_eq!(out["task"], "ping");
    }
}
