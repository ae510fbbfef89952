//! Per-chat query dispatch.
//!
//! At most one handler runs per chat. A query for a chat that already has a
//! handler lands in that handler's inbox and is sent with its next cycle;
//! different chats run fully in parallel. The active-chat table and every
//! inbox live behind one mutex, so a handler can only give up its slot when
//! the inbox is empty at that same instant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_core::config::DispatchConfig;
use parley_core::types::{ChatId, Query, QueryRx, QueryTx, Reply, ReplyTx};
use parley_core::TaskLifecycle;

use crate::annotations::render_messages;
use crate::backend::{AssistantBackend, Role, RunStatus};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Pause between two cycles of one handler.
    pub interval: Duration,
    /// A handler with an empty inbox for this long ends.
    pub idle_timeout: Duration,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            interval: config.handler_interval(),
            idle_timeout: config.handler_idle(),
        }
    }
}

/// Backend thread bound to a chat for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationThread {
    pub thread_id: String,
    /// Newest message already relayed; later listings start after it.
    pub last_message_id: Option<String>,
}

struct Slot {
    generation: u64,
    pending: VecDeque<String>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<ChatId, Slot>,
    spawned: u64,
}

enum Admission {
    Coalesced,
    Spawn(u64),
}

enum Inbox {
    Texts(Vec<String>),
    Empty,
    Released,
}

/// The set of chats with a live handler, shared by the dispatcher, its
/// handlers and whoever needs to abort them at shutdown.
#[derive(Clone, Default)]
pub struct ActiveChats {
    table: Arc<Mutex<Table>>,
}

impl ActiveChats {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, chat_id: ChatId) -> bool {
        self.lock().slots.contains_key(&chat_id)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chats(&self) -> Vec<ChatId> {
        let mut chats: Vec<ChatId> = self.lock().slots.keys().copied().collect();
        chats.sort_unstable();
        chats
    }

    /// Handlers started since creation.
    pub fn handlers_spawned(&self) -> u64 {
        self.lock().spawned
    }

    /// Abort every live handler. Slots are freed by the handlers' guards.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| slot.abort.clone())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    fn admit(&self, chat_id: ChatId, text: String) -> Admission {
        let mut table = self.lock();
        if let Some(slot) = table.slots.get_mut(&chat_id) {
            slot.pending.push_back(text);
            return Admission::Coalesced;
        }
        table.spawned += 1;
        let generation = table.spawned;
        table.slots.insert(
            chat_id,
            Slot {
                generation,
                pending: VecDeque::from([text]),
                abort: None,
            },
        );
        Admission::Spawn(generation)
    }

    fn set_abort(&self, chat_id: ChatId, generation: u64, handle: AbortHandle) {
        if let Some(slot) = self.lock().slots.get_mut(&chat_id) {
            if slot.generation == generation {
                slot.abort = Some(handle);
            }
        }
    }

    /// Take the whole inbox, or free the slot if it is empty and
    /// `may_release` holds.
    fn next(&self, chat_id: ChatId, generation: u64, may_release: bool) -> Inbox {
        let mut table = self.lock();
        let Some(slot) = table
            .slots
            .get_mut(&chat_id)
            .filter(|slot| slot.generation == generation)
        else {
            return Inbox::Released;
        };
        if !slot.pending.is_empty() {
            return Inbox::Texts(slot.pending.drain(..).collect());
        }
        if may_release {
            table.slots.remove(&chat_id);
            return Inbox::Released;
        }
        Inbox::Empty
    }

    /// Free the slot if it still belongs to `generation`. Returns the number
    /// of queued texts that never made it into a cycle.
    fn release(&self, chat_id: ChatId, generation: u64) -> usize {
        let mut table = self.lock();
        match table.slots.get(&chat_id) {
            Some(slot) if slot.generation == generation => {}
            _ => return 0,
        }
        table
            .slots
            .remove(&chat_id)
            .map(|slot| slot.pending.len())
            .unwrap_or(0)
    }
}

/// Frees the handler's slot however the handler ends.
struct SlotGuard {
    active: ActiveChats,
    chat_id: ChatId,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let lost = self.active.release(self.chat_id, self.generation);
        if lost > 0 {
            warn!(chat_id = self.chat_id, lost, "handler ended with unsent messages");
        }
    }
}

struct Shared<B> {
    backend: Arc<B>,
    assistant_id: String,
    threads: DashMap<ChatId, ConversationThread>,
    active: ActiveChats,
    replies: ReplyTx,
    lifecycle: TaskLifecycle,
    settings: DispatchSettings,
}

pub struct QueryDispatcher<B> {
    shared: Arc<Shared<B>>,
    queries: QueryRx,
    sender: QueryTx,
}

impl<B: AssistantBackend + 'static> QueryDispatcher<B> {
    pub fn new(
        backend: Arc<B>,
        assistant_id: impl Into<String>,
        settings: DispatchSettings,
        replies: ReplyTx,
        lifecycle: TaskLifecycle,
    ) -> Self {
        let (sender, queries) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                backend,
                assistant_id: assistant_id.into(),
                threads: DashMap::new(),
                active: ActiveChats::default(),
                replies,
                lifecycle,
                settings,
            }),
            queries,
            sender,
        }
    }

    /// Producer side of the query queue.
    pub fn sender(&self) -> QueryTx {
        self.sender.clone()
    }

    pub fn active_chats(&self) -> ActiveChats {
        self.shared.active.clone()
    }

    /// Enqueue a query without waiting for it to be handled.
    pub fn submit(&self, chat_id: ChatId, text: impl Into<String>) {
        if self.sender.send(Query::new(chat_id, text)).is_err() {
            warn!(chat_id, "query queue closed, message dropped");
        }
    }

    pub fn cancel_all(&self) -> usize {
        self.shared.active.cancel_all()
    }

    /// Drain the query queue until stop is requested.
    pub async fn run(mut self) {
        info!("query dispatcher started");
        loop {
            tokio::select! {
                _ = self.shared.lifecycle.stopped() => break,
                next = self.queries.recv() => match next {
                    Some(query) => self.accept(query),
                    None => break,
                },
            }
        }
        info!(
            active = self.shared.active.len(),
            "query dispatcher stopped"
        );
    }

    fn accept(&self, query: Query) {
        let Query { chat_id, text } = query;
        match self.shared.active.admit(chat_id, text) {
            Admission::Coalesced => debug!(chat_id, "chat busy, message joins the next cycle"),
            Admission::Spawn(generation) => {
                let shared = Arc::clone(&self.shared);
                // Owned by the future from the start, so an abort before the
                // first poll still frees the slot.
                let slot = SlotGuard {
                    active: self.shared.active.clone(),
                    chat_id,
                    generation,
                };
                let handle = self.shared.lifecycle.track(format!("query:{chat_id}"), async move {
                    let _slot = slot;
                    run_handler(shared, chat_id, generation).await;
                });
                self.shared
                    .active
                    .set_abort(chat_id, generation, handle.abort_handle());
                debug!(chat_id, generation, "chat handler spawned");
            }
        }
    }
}

async fn run_handler<B: AssistantBackend>(shared: Arc<Shared<B>>, chat_id: ChatId, generation: u64) {
    shared.handle_chat(chat_id, generation).await;
    debug!(chat_id, "chat handler finished");
}

impl<B: AssistantBackend> Shared<B> {
    /// Cycle until the inbox stays empty past the idle timeout or stop is
    /// requested. After a failed cycle the slot is given up as soon as the
    /// inbox is empty, but texts queued meanwhile still get their own cycle.
    async fn handle_chat(&self, chat_id: ChatId, generation: u64) {
        let mut last_activity = Instant::now();
        let mut release_now = false;
        loop {
            let may_release = release_now
                || self.lifecycle.is_stopping()
                || last_activity.elapsed() >= self.settings.idle_timeout;
            match self.active.next(chat_id, generation, may_release) {
                Inbox::Released => return,
                Inbox::Empty => {}
                Inbox::Texts(texts) => match self.cycle(chat_id, texts).await {
                    Ok(RunStatus::Completed) => {
                        release_now = false;
                        last_activity = Instant::now();
                    }
                    Ok(status) => {
                        warn!(chat_id, ?status, "run ended without completing, no reply");
                        release_now = true;
                        continue;
                    }
                    Err(e) => {
                        warn!(chat_id, error = %e, "query failed");
                        release_now = true;
                        continue;
                    }
                },
            }
            tokio::select! {
                _ = self.lifecycle.stopped() => {}
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
    }

    /// One round trip: append `texts`, run, relay the run's new messages.
    async fn cycle(&self, chat_id: ChatId, texts: Vec<String>) -> Result<RunStatus> {
        let thread_id = self.thread_for(chat_id).await?;
        for text in &texts {
            self.backend
                .append_message(&thread_id, text, Role::User)
                .await?;
        }
        debug!(chat_id, messages = texts.len(), "messages appended, starting run");

        let run = self
            .backend
            .create_and_await_run(&thread_id, &self.assistant_id)
            .await?;
        if run.status != RunStatus::Completed {
            return Ok(run.status);
        }

        let after = self
            .threads
            .get(&chat_id)
            .and_then(|thread| thread.last_message_id.clone());
        let messages = self
            .backend
            .list_messages_after(&thread_id, &run.id, after.as_deref())
            .await?;
        if let Some(last) = messages.last() {
            if let Some(mut thread) = self.threads.get_mut(&chat_id) {
                thread.last_message_id = Some(last.id.clone());
            }
        }

        let text = render_messages(self.backend.as_ref(), &messages).await;
        if text.is_empty() {
            debug!(chat_id, run_id = %run.id, "run produced no text");
        } else if self.replies.send(Reply::new(chat_id, text)).is_err() {
            warn!(chat_id, "response queue closed, reply dropped");
        } else {
            info!(chat_id, run_id = %run.id, "reply queued");
        }
        Ok(RunStatus::Completed)
    }

    async fn thread_for(&self, chat_id: ChatId) -> Result<String> {
        let existing = self
            .threads
            .get(&chat_id)
            .map(|thread| thread.thread_id.clone());
        if let Some(thread_id) = existing {
            return Ok(thread_id);
        }
        let thread_id = self.backend.create_thread(chat_id).await?;
        self.threads.insert(
            chat_id,
            ConversationThread {
                thread_id: thread_id.clone(),
                last_message_id: None,
            },
        );
        info!(chat_id, thread_id = %thread_id, "conversation thread created");
        Ok(thread_id)
    }
}
