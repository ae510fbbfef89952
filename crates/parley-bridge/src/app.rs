//! Composition root: wires the queues, spawns every loop as a tracked task
//! and runs the shutdown sequence.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_assistant::{ActiveChats, AssistantBackend, DispatchSettings, QueryDispatcher};
use parley_core::config::{CommandConfig, ParleyConfig};
use parley_core::types::ReplyTx;
use parley_core::{ParleyError, TaskLifecycle};
use parley_telegram::commands::sync_commands;
use parley_telegram::send::run_reply_delivery;
use parley_telegram::{
    ChatPlatform, CommandDispatcher, CommandRegistry, IngestionLoop, OffsetTracker, PollParams,
    StaticReply,
};

/// How the bridge wound down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every task finished within the grace period.
    pub graceful: bool,
    /// Chat handlers aborted after the grace period.
    pub aborted: usize,
    /// Tasks still tracked when the bridge gave up waiting.
    pub remaining: Vec<String>,
}

pub struct Bridge<P, B> {
    platform: Arc<P>,
    backend: Arc<B>,
    assistant_id: String,
    config: ParleyConfig,
    state_log: bool,
}

impl<P, B> Bridge<P, B>
where
    P: ChatPlatform + 'static,
    B: AssistantBackend + 'static,
{
    pub fn new(
        platform: Arc<P>,
        backend: Arc<B>,
        assistant_id: impl Into<String>,
        config: ParleyConfig,
    ) -> Self {
        Self {
            platform,
            backend,
            assistant_id: assistant_id.into(),
            config,
            state_log: false,
        }
    }

    /// Periodically log the tracked task names (debug mode).
    pub fn with_state_log(mut self, enabled: bool) -> Self {
        self.state_log = enabled;
        self
    }

    /// Serve until `shutdown` resolves, then stop and drain.
    ///
    /// Invalid command configuration fails before anything is spawned.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<ShutdownReport, ParleyError> {
        let Self {
            platform,
            backend,
            assistant_id,
            config,
            state_log,
        } = self;

        let lifecycle = TaskLifecycle::new();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut registry = build_registry(&config.commands, &reply_tx)?;
        match platform.bot_username().await {
            Ok(username) => registry.set_bot_username(username),
            Err(e) => warn!(error = %e, "bot username unknown, accepting every /cmd@bot"),
        }
        let registry = Arc::new(registry);
        if config.telegram.sync_commands {
            if let Err(e) = sync_commands(platform.as_ref(), &registry).await {
                warn!(error = %e, "command menu sync failed");
            }
        }

        let dispatcher = QueryDispatcher::new(
            backend,
            assistant_id,
            DispatchSettings::from(&config.dispatch),
            reply_tx,
            lifecycle.clone(),
        );
        let active = dispatcher.active_chats();

        let ingestion = IngestionLoop::new(
            Arc::clone(&platform),
            PollParams {
                limit: config.telegram.poll_limit,
                timeout: config.telegram.poll_timeout(),
                allowed_updates: config.telegram.allowed_updates.clone(),
            },
            OffsetTracker::new(config.telegram.reset_window()),
            Arc::clone(&registry),
            command_tx,
            dispatcher.sender(),
            lifecycle.clone(),
        );
        let commands = CommandDispatcher::new(registry, command_rx, lifecycle.clone());

        lifecycle.track(
            "reply-delivery",
            run_reply_delivery(platform, reply_rx, lifecycle.clone()),
        );
        lifecycle.track("commands", commands.run());
        lifecycle.track("queries", dispatcher.run());
        lifecycle.track("ingestion", ingestion.run());
        if state_log {
            tokio::spawn(log_state(
                lifecycle.clone(),
                active.clone(),
                config.dispatch.state_log_period(),
            ));
        }
        info!(tasks = lifecycle.len(), "bridge running");

        shutdown.await;
        info!("shutdown requested, draining tasks");
        Ok(drain(&lifecycle, &active, config.dispatch.shutdown_grace()).await)
    }
}

/// One [`StaticReply`] command per configured entry, in configuration order.
pub fn build_registry(
    commands: &[CommandConfig],
    replies: &ReplyTx,
) -> Result<CommandRegistry, ParleyError> {
    let mut registry = CommandRegistry::new();
    for command in commands {
        registry.register(
            &command.name,
            command.description.as_deref(),
            Arc::new(StaticReply::new(command.reply.clone(), replies.clone())),
        )?;
    }
    Ok(registry)
}

/// Request stop and wait for the tracked set to drain. After `grace`, abort
/// the chat handlers and wait one more `grace` for the rest.
async fn drain(lifecycle: &TaskLifecycle, active: &ActiveChats, grace: Duration) -> ShutdownReport {
    lifecycle.request_stop();
    if tokio::time::timeout(grace, lifecycle.work_complete())
        .await
        .is_ok()
    {
        info!("all tasks finished");
        return ShutdownReport {
            graceful: true,
            aborted: 0,
            remaining: Vec::new(),
        };
    }

    let aborted = active.cancel_all();
    warn!(
        aborted,
        pending = ?lifecycle.task_names(),
        "grace period over, chat handlers aborted"
    );
    if tokio::time::timeout(grace, lifecycle.work_complete())
        .await
        .is_err()
    {
        warn!(pending = ?lifecycle.task_names(), "tasks still running at exit");
    }
    ShutdownReport {
        graceful: false,
        aborted,
        remaining: lifecycle.task_names(),
    }
}

async fn log_state(lifecycle: TaskLifecycle, active: ActiveChats, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = lifecycle.work_complete() => break,
            _ = ticker.tick() => debug!(
                tasks = ?lifecycle.task_names(),
                active_chats = ?active.chats(),
                stopping = lifecycle.is_stopping(),
                "bridge state"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_follows_configuration_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = build_registry(&ParleyConfig::default().commands, &tx).unwrap();
        let names: Vec<String> = registry.menu().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["start".to_string(), "help".to_string()]);
    }

    #[test]
    fn duplicate_command_is_fatal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = CommandConfig {
            name: "start".to_string(),
            description: None,
            reply: "Hi".to_string(),
        };
        let err = build_registry(&[command.clone(), command], &tx).err().unwrap();
        assert!(matches!(err, ParleyError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn drain_on_an_idle_lifecycle_is_graceful() {
        let lifecycle = TaskLifecycle::new();
        let report = drain(&lifecycle, &ActiveChats::default(), Duration::from_millis(50)).await;
        assert!(report.graceful);
        assert!(lifecycle.is_complete());
    }

    #[tokio::test]
    async fn drain_reports_tasks_that_ignore_stop() {
        let lifecycle = TaskLifecycle::new();
        lifecycle.track("stuck", std::future::pending::<()>());
        let report = drain(&lifecycle, &ActiveChats::default(), Duration::from_millis(20)).await;
        assert!(!report.graceful);
        assert_eq!(report.aborted, 0);
        assert_eq!(report.remaining, vec!["stuck".to_string()]);
    }
}
