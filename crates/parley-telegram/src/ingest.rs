//! Long-poll ingestion loop.
//!
//! One `getUpdates` call at a time, raced against the stop signal. Each
//! returned update advances the offset cursor and is routed to the command
//! queue or the query queue. Nothing here is durable: unroutable updates are
//! dropped and a failed batch is logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::types::{CommandInvocation, CommandTx, Query, QueryTx};
use parley_core::TaskLifecycle;

use crate::commands::{parse_command, CommandRegistry};
use crate::offset::OffsetTracker;
use crate::platform::{ChatPlatform, PollParams, Update};

/// Pause after a failed fetch before polling again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Where a single update ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Command(CommandInvocation),
    Query(Query),
    Dropped,
}

pub struct IngestionLoop<P: ChatPlatform> {
    platform: Arc<P>,
    params: PollParams,
    tracker: OffsetTracker,
    registry: Arc<CommandRegistry>,
    commands: CommandTx,
    queries: QueryTx,
    lifecycle: TaskLifecycle,
}

impl<P: ChatPlatform> IngestionLoop<P> {
    pub fn new(
        platform: Arc<P>,
        params: PollParams,
        tracker: OffsetTracker,
        registry: Arc<CommandRegistry>,
        commands: CommandTx,
        queries: QueryTx,
        lifecycle: TaskLifecycle,
    ) -> Self {
        Self {
            platform,
            params,
            tracker,
            registry,
            commands,
            queries,
            lifecycle,
        }
    }

    pub fn offset(&self) -> i64 {
        self.tracker.current_offset()
    }

    /// Poll until stop is requested.
    pub async fn run(mut self) {
        info!(offset = self.offset(), "polling procedure initiated");
        while !self.lifecycle.is_stopping() {
            let offset = self.tracker.current_offset();
            let fetched = tokio::select! {
                _ = self.lifecycle.stopped() => {
                    debug!("stop requested during long poll, fetch cancelled");
                    break;
                }
                fetched = self.platform.fetch_updates(offset, &self.params) => fetched,
            };

            match fetched {
                Ok(updates) => self.process_batch(updates),
                Err(e) => {
                    warn!(error = %e, offset, "fetching updates failed");
                    tokio::select! {
                        _ = self.lifecycle.stopped() => break,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        }
        info!(offset = self.offset(), "polling stopped");
    }

    /// Advance the cursor over `updates` in order and route each one.
    pub fn process_batch(&mut self, updates: Vec<Update>) {
        if updates.is_empty() {
            return;
        }
        let count = updates.len();
        for update in updates {
            self.tracker.advance(update.update_id, update.timestamp);
            match self.route(update) {
                Routed::Command(invocation) => {
                    if self.commands.send(invocation).is_err() {
                        warn!("command queue closed, command dropped");
                    }
                }
                Routed::Query(query) => {
                    if self.queries.send(query).is_err() {
                        warn!("query queue closed, message dropped");
                    }
                }
                Routed::Dropped => {}
            }
        }
        info!(count, offset = self.offset(), "new update offset");
    }

    /// Classify one update without touching the cursor.
    pub fn route(&self, update: Update) -> Routed {
        let (Some(chat_id), Some(text)) = (update.chat_id, update.text) else {
            debug!(update_id = update.update_id, "update without chat or text dropped");
            return Routed::Dropped;
        };
        info!(chat_id, update_id = update.update_id, "received message");

        if let Some(command) = parse_command(&text) {
            if !self.registry.is_addressed_to_us(command.addressee.as_deref()) {
                debug!(chat_id, command = %command.name, "command for another bot dropped");
                return Routed::Dropped;
            }
            if self.registry.contains(&command.name) {
                return Routed::Command(CommandInvocation::new(
                    chat_id,
                    command.name,
                    command.params,
                ));
            }
        }
        Routed::Query(Query::new(chat_id, text))
    }
}
