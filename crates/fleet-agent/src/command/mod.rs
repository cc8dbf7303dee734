//! Command dispatch: maps a command type to its handler and turns the
//! handler's result into exactly one terminal update.

pub mod handlers;
pub mod install;

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

use fleet_proto::coordinator_v1::{Command, CommandStatus, CommandUpdate};
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::{
    connection::{CommandHandler, CommandReplier},
    error::{MAX_OUTPUT_BYTES, format_error_chain, truncate_utf8},
};

/// Progress reporting for one command. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    command_id: String,
    tx: Option<mpsc::UnboundedSender<CommandUpdate>>,
}

impl ProgressSink {
    pub fn channel(command_id: &str) -> (Self, mpsc::UnboundedReceiver<CommandUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                command_id: command_id.to_string(),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// A sink that drops everything.
    pub fn discard(command_id: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            tx: None,
        }
    }

    pub fn report(&self, percent: u32, message: impl Into<String>) {
        let Some(tx) = &self.tx else { return };
        let _ = tx.send(CommandUpdate {
            command_id: self.command_id.clone(),
            status: CommandStatus::InProgress as i32,
            progress: percent.min(100),
            message: message.into(),
            output: String::new(),
        });
    }
}

/// Runs one command type. `Ok` carries the output text.
#[tonic::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String>;
}

struct FnHandler<F>(F);

#[tonic::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Command, ProgressSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        (self.0)(command.clone(), progress.clone()).await
    }
}

pub fn completed(command_id: &str, output: impl Into<String>) -> CommandUpdate {
    CommandUpdate {
        command_id: command_id.to_string(),
        status: CommandStatus::Completed as i32,
        progress: 100,
        message: "completed".to_string(),
        output: truncate_utf8(&output.into(), MAX_OUTPUT_BYTES),
    }
}

/// Failure text goes in `output`, where operators read command results.
pub fn failed(command_id: &str, error: &str) -> CommandUpdate {
    let text = truncate_utf8(error, MAX_OUTPUT_BYTES);
    CommandUpdate {
        command_id: command_id.to_string(),
        status: CommandStatus::Failed as i32,
        progress: 0,
        message: text.clone(),
        output: text,
    }
}

#[derive(Default)]
pub struct CommandRouter {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("types", &self.command_types())
            .finish()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `command_type`.
    pub fn register_handler(&self, command_type: &str, handler: Arc<dyn Handler>) {
        let prev = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command_type.to_string(), handler);
        if prev.is_some() {
            tracing::debug!(command_type, "command handler replaced");
        }
    }

    pub fn register_fn<F, Fut>(&self, command_type: &str, f: F)
    where
        F: Fn(Command, ProgressSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.register_handler(command_type, Arc::new(FnHandler(f)));
    }

    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Executes `command` and returns its terminal update. Unknown types,
    /// handler errors and handler panics all become `failed`.
    pub async fn execute(&self, command: &Command, progress: &ProgressSink) -> CommandUpdate {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&command.command_type)
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!(command_type = %command.command_type, "unknown command type");
            return failed(
                &command.command_id,
                &format!("unknown command type: {}", command.command_type),
            );
        };

        let started = std::time::Instant::now();
        let result = AssertUnwindSafe(handler.run(command, progress))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(output)) => {
                tracing::info!(elapsed_ms, "command completed");
                completed(&command.command_id, output)
            }
            Ok(Err(e)) => {
                let msg = format_error_chain(&e);
                tracing::warn!(elapsed_ms, error = %msg, "command failed");
                failed(&command.command_id, &msg)
            }
            Err(_) => {
                tracing::error!(elapsed_ms, "command handler panicked");
                failed(&command.command_id, "command handler panicked")
            }
        }
    }
}

#[tonic::async_trait]
impl CommandHandler for CommandRouter {
    async fn handle(&self, command: Command, replier: CommandReplier) {
        let (sink, mut rx) = ProgressSink::channel(&command.command_id);
        let forward = tokio::spawn({
            let replier = replier.clone();
            async move {
                while let Some(update) = rx.recv().await {
                    if replier.send(update).await.is_err() {
                        break;
                    }
                }
            }
        });

        let update = self.execute(&command, &sink).await;
        // Progress must land before the terminal frame.
        drop(sink);
        let _ = forward.await;

        if let Err(e) = replier.send(update).await {
            tracing::warn!(error = %e, "failed to send command result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: &str, ty: &str) -> Command {
        Command {
            command_id: id.to_string(),
            command_type: ty.to_string(),
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_type_fails() {
        let router = CommandRouter::new();
        let u = router
            .execute(&command("c1", "explode"), &ProgressSink::discard("c1"))
            .await;
        assert_eq!(u.status(), CommandStatus::Failed);
        assert_eq!(u.output, "unknown command type: explode");
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let router = CommandRouter::new();
        router.register_fn("status", |_, _| async { Ok("old".to_string()) });
        router.register_fn("status", |_, _| async { Ok("new".to_string()) });

        let u = router
            .execute(&command("c1", "status"), &ProgressSink::discard("c1"))
            .await;
        assert_eq!(u.status(), CommandStatus::Completed);
        assert_eq!(u.output, "new");
        assert_eq!(router.command_types(), vec!["status"]);
    }

    #[tokio::test]
    async fn errors_and_panics_become_failed() {
        let router = CommandRouter::new();
        router.register_fn("bad", |_, _| async {
            Err(anyhow::anyhow!("disk full").context("install"))
        });
        router.register_fn("boom", |_, _| async {
            if true {
                panic!("handler bug");
            }
            Ok(String::new())
        });

        let u = router
            .execute(&command("c1", "bad"), &ProgressSink::discard("c1"))
            .await;
        assert_eq!(u.status(), CommandStatus::Failed);
        assert_eq!(u.output, "install: disk full");
        assert_eq!(u.message, u.output);

        let u = router
            .execute(&command("c2", "boom"), &ProgressSink::discard("c2"))
            .await;
        assert_eq!(u.status(), CommandStatus::Failed);
        assert_eq!(u.output, "command handler panicked");
    }

    #[tokio::test]
    async fn progress_is_clamped_and_ordered() {
        let router = CommandRouter::new();
        router.register_fn("work", |_, p: ProgressSink| async move {
            p.report(30, "downloading");
            p.report(250, "almost");
            Ok("done".to_string())
        });

        let (sink, mut rx) = ProgressSink::channel("c1");
        let u = router.execute(&command("c1", "work"), &sink).await;
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status(), CommandStatus::InProgress);
        assert_eq!((first.progress, first.message.as_str()), (30, "downloading"));
        assert_eq!(rx.recv().await.unwrap().progress, 100);
        assert!(rx.recv().await.is_none());
        assert_eq!(u.status(), CommandStatus::Completed);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let router = CommandRouter::new();
        router.register_fn("loud", |_, _| async { Ok("x".repeat(MAX_OUTPUT_BYTES * 2)) });
        let u = router
            .execute(&command("c1", "loud"), &ProgressSink::discard("c1"))
            .await;
        assert!(u.output.len() <= MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn router_serves_the_command_stream() {
        use crate::testkit::{FakeCoordinator, connection_for};
        use fleet_proto::coordinator_v1::RegisterRequest;
        use tokio_util::{sync::CancellationToken, task::TaskTracker};

        let coord = FakeCoordinator::new();
        let conn = connection_for(&coord);
        conn.connect(std::time::Duration::from_secs(1)).await.unwrap();
        conn.register(RegisterRequest::default()).await.unwrap();

        let router = Arc::new(CommandRouter::new());
        router.register_fn("work", |_, p: ProgressSink| async move {
            p.report(50, "half");
            Ok("ok".to_string())
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tokio::spawn({
            let (conn, cancel, tasks) = (conn.clone(), cancel.clone(), tasks.clone());
            async move { conn.start_command_stream(&cancel, &tasks, router).await }
        });
        coord.wait_for_stream_open().await;
        coord.push_command("c-9", "work", &[]);

        let updates = coord.updates_until_terminal().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status(), CommandStatus::InProgress);
        assert_eq!(updates[1].status(), CommandStatus::Completed);
        assert_eq!(updates[1].output, "ok");

        cancel.cancel();
        conn.close().await;
    }
}
