use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use parley_assistant::backend::{Annotation, AssistantBackend, Role, Run, RunStatus, ThreadMessage};
use parley_assistant::error::Result as AssistantResult;
use parley_bridge::Bridge;
use parley_core::config::ParleyConfig;
use parley_core::types::ChatId;
use parley_telegram::{BotCommandInfo, ChatPlatform, PollParams, TelegramError, Update};

/// Serves scripted batches, then idles like a quiet long poll.
struct FakeTelegram {
    batches: Mutex<VecDeque<Vec<Update>>>,
    sent: mpsc::UnboundedSender<(ChatId, String)>,
    menu: Mutex<Option<Vec<BotCommandInfo>>>,
    menu_lookup_fails: bool,
}

impl FakeTelegram {
    fn new(batches: Vec<Vec<Update>>, sent: mpsc::UnboundedSender<(ChatId, String)>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            sent,
            menu: Mutex::new(None),
            menu_lookup_fails: false,
        }
    }
}

#[async_trait]
impl ChatPlatform for FakeTelegram {
    async fn fetch_updates(
        &self,
        _offset: i64,
        _params: &PollParams,
    ) -> Result<Vec<Update>, TelegramError> {
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => Ok(batch),
            None => std::future::pending().await,
        }
    }

    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), TelegramError> {
        self.sent
            .send((chat_id, text.to_string()))
            .map_err(|_| TelegramError::QueueClosed)
    }

    async fn bot_username(&self) -> Result<Option<String>, TelegramError> {
        Ok(Some("parley_bot".to_string()))
    }

    async fn get_registered_commands(&self) -> Result<Vec<BotCommandInfo>, TelegramError> {
        if self.menu_lookup_fails {
            return Err(TelegramError::QueueClosed);
        }
        Ok(Vec::new())
    }

    async fn set_registered_commands(
        &self,
        commands: Vec<BotCommandInfo>,
    ) -> Result<(), TelegramError> {
        *self.menu.lock().unwrap() = Some(commands);
        Ok(())
    }
}

/// Answers every run with an echo of the last appended message.
#[derive(Default)]
struct EchoAssistant {
    last: Mutex<String>,
}

#[async_trait]
impl AssistantBackend for EchoAssistant {
    async fn create_thread(&self, chat_id: ChatId) -> AssistantResult<String> {
        Ok(format!("thread_{chat_id}"))
    }

    async fn append_message(&self, _thread_id: &str, text: &str, _role: Role) -> AssistantResult<()> {
        *self.last.lock().unwrap() = text.to_string();
        Ok(())
    }

    async fn create_and_await_run(&self, thread_id: &str, _assistant_id: &str) -> AssistantResult<Run> {
        Ok(Run {
            id: format!("run_{thread_id}"),
            status: RunStatus::Completed,
        })
    }

    async fn list_messages_after(
        &self,
        _thread_id: &str,
        run_id: &str,
        _after: Option<&str>,
    ) -> AssistantResult<Vec<ThreadMessage>> {
        let text = format!("echo: {}", self.last.lock().unwrap());
        Ok(vec![ThreadMessage::text(run_id.replace("run", "msg"), text)])
    }

    async fn resolve_annotation(&self, _annotation: &Annotation) -> AssistantResult<String> {
        Ok(String::new())
    }
}

fn test_config() -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.dispatch.handler_interval_ms = 10;
    config.dispatch.shutdown_grace_secs = 2;
    config
}

async fn next_sent(sent: &mut mpsc::UnboundedReceiver<(ChatId, String)>) -> (ChatId, String) {
    tokio::time::timeout(Duration::from_secs(3), sent.recv())
        .await
        .expect("message sent in time")
        .expect("platform alive")
}

#[tokio::test]
async fn commands_and_queries_reach_their_chats() {
    let now = Utc::now();
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    let platform = Arc::new(FakeTelegram::new(
        vec![vec![
            Update::text_message(5, 1, "/start", now),
            Update::text_message(6, 2, "hello", now),
        ]],
        sent_tx,
    ));
    let bridge = Bridge::new(
        Arc::clone(&platform),
        Arc::new(EchoAssistant::default()),
        "asst_test",
        test_config(),
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        let mut got = vec![next_sent(&mut sent).await, next_sent(&mut sent).await];
        got.sort();
        stop_tx.send(()).unwrap();
        got
    };
    let (report, got) = tokio::join!(
        bridge.run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(
        got,
        vec![(1, "Hi".to_string()), (2, "echo: hello".to_string())]
    );
    let report = report.unwrap();
    assert!(report.graceful, "{report:?}");

    let menu = platform.menu.lock().unwrap().clone().expect("menu pushed");
    let names: Vec<_> = menu.into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["start".to_string(), "help".to_string()]);
}

#[tokio::test]
async fn addressed_command_with_params_is_handled() {
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    let now = Utc::now();
    let platform = Arc::new(FakeTelegram::new(
        vec![vec![
            Update::text_message(1, -100, "/help@other_bot please", now),
            Update::text_message(2, -100, "/HELP@parley_bot please", now),
        ]],
        sent_tx,
    ));
    let config = test_config();
    let expected = config.commands[1].reply.clone();
    let bridge = Bridge::new(platform, Arc::new(EchoAssistant::default()), "asst_test", config);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        let got = next_sent(&mut sent).await;
        stop_tx.send(()).unwrap();
        got
    };
    let (report, got) = tokio::join!(
        bridge.run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(got, (-100, expected));
    assert!(report.unwrap().graceful);
}

#[tokio::test]
async fn shutdown_without_traffic_drains_immediately() {
    let (sent_tx, _sent) = mpsc::unbounded_channel();
    let platform = Arc::new(FakeTelegram::new(Vec::new(), sent_tx));
    let bridge = Bridge::new(platform, Arc::new(EchoAssistant::default()), "asst_test", test_config());

    let report = tokio::time::timeout(
        Duration::from_secs(3),
        bridge.run(tokio::time::sleep(Duration::from_millis(20))),
    )
    .await
    .expect("bridge stops");
    assert!(report.unwrap().graceful);
}

#[tokio::test]
async fn menu_lookup_failure_is_not_fatal() {
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    let mut platform = FakeTelegram::new(
        vec![vec![Update::text_message(3, 4, "/start", Utc::now())]],
        sent_tx,
    );
    platform.menu_lookup_fails = true;
    let platform = Arc::new(platform);
    let bridge = Bridge::new(
        Arc::clone(&platform),
        Arc::new(EchoAssistant::default()),
        "asst_test",
        test_config(),
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        let got = next_sent(&mut sent).await;
        stop_tx.send(()).unwrap();
        got
    };
    let (report, got) = tokio::join!(
        bridge.run(async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(got, (4, "Hi".to_string()));
    assert!(report.unwrap().graceful);
    assert!(platform.menu.lock().unwrap().is_none());
}
