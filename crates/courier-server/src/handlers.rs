//! Task handlers hosted by this process.

use courier_jobs::{Lifecycle, Task, TaskContext, TaskError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Task type for outgoing email.
pub const EMAIL_SEND: &str = "email:send";

/// Payload of an `email:send` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// Registers every handler on `lifecycle`.
pub fn register(lifecycle: &Lifecycle) {
    lifecycle.handle_fn(EMAIL_SEND, send_email);
}

async fn send_email(ctx: TaskContext, task: Task) -> Result<(), TaskError> {
    // A payload that does not parse will never parse.
    let email: EmailPayload = task
        .payload_json()
        .map_err(|e| TaskError::skip_retry(format!("malformed email payload: {}", e)))?;

    if !email.to.contains('@') {
        return Err(TaskError::skip_retry(format!("invalid recipient '{}'", email.to)));
    }

    info!(
        task_id = %ctx.task_id,
        to = %email.to,
        subject = %email.subject,
        attempt = ctx.retried + 1,
        "Sending email"
    );

    // Stand-in for the mail transport.
    tokio::select! {
        () = ctx.cancelled() => Err(TaskError::handler("email delivery cancelled")),
        () = tokio::time::sleep(Duration::from_millis(25)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_config::AppConfig;
    use courier_jobs::broker::Broker;
    use courier_jobs::{EnqueueOptions, MemoryBroker};
    use std::sync::Arc;

    async fn run_one(payload: &str) -> (u64, u64) {
        let mut config = AppConfig::default();
        config.worker.concurrency = 1;
        config.worker.poll_interval_ms = 10;
        config.worker.handle_signals = false;

        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = Lifecycle::new(config, broker.clone());
        register(&lifecycle);

        lifecycle
            .enqueue(Task::new(EMAIL_SEND, payload), EnqueueOptions::new().max_retry(3))
            .await
            .unwrap();

        for _ in 0..200 {
            let stats = broker.queue_stats("default").await.unwrap();
            if stats.processed + stats.dead > 0 {
                lifecycle.shutdown().await;
                return (stats.processed, stats.dead);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("email task was never finished");
    }

    #[tokio::test]
    async fn test_send_email() {
        let (processed, dead) = run_one(r#"{"to":"user@example.com","subject":"Welcome"}"#).await;
        assert_eq!((processed, dead), (1, 0));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retried() {
        let (processed, dead) = run_one("not json").await;
        assert_eq!((processed, dead), (0, 1));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_not_retried() {
        let (processed, dead) = run_one(r#"{"to":"nobody","subject":"Hi"}"#).await;
        assert_eq!((processed, dead), (0, 1));
    }
}
