use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{
    channel, EnvelopeReceiver, EnvelopeSender, Listener, ListenerConfig, ListenerRegistry,
};
use crate::envelope::{Envelope, ReplyRequest};

pub const KIND: &str = "telegram";

/// Telegram rejects messages over 4096 chars; leave some headroom.
const MAX_MESSAGE_LEN: usize = 4000;

const SHUTDOWN_RETRY: Duration = Duration::from_millis(200);

pub fn register(registry: &mut ListenerRegistry) {
    registry.register(KIND, Box::new(construct));
}

fn construct(
    config: &ListenerConfig,
    requests: EnvelopeSender,
    answers: EnvelopeReceiver,
) -> Result<Box<dyn Listener>> {
    Ok(Box::new(TelegramListener::new(config, requests, answers)?))
}

/// Break a reply into pieces Telegram accepts, cutting after the last newline
/// (or failing that, the last space) that fits in `max_len` bytes.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        let mut limit = max_len;
        while limit > 0 && !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            limit = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }

        let window = &rest[..limit];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map_or(limit, |pos| pos + 1);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks.push(rest.to_string());
    chunks
}

fn allowed_user_ids(config: &ListenerConfig) -> Result<Vec<u64>> {
    let Some(value) = config.settings.get("allowed_user_ids") else {
        return Ok(Vec::new());
    };
    let ids = value
        .as_array()
        .context("allowed_user_ids must be an array of user ids")?;
    ids.iter()
        .map(|id| {
            id.as_integer()
                .and_then(|n| u64::try_from(n).ok())
                .with_context(|| format!("Invalid Telegram user id: {}", id))
        })
        .collect()
}

/// One request/answer round trip at a time, shared by every update handler.
struct Exchange {
    listener_id: String,
    bot_username: String,
    allowed_user_ids: Vec<u64>,
    requests: EnvelopeSender,
    answers: tokio::sync::Mutex<EnvelopeReceiver>,
}

impl Exchange {
    async fn ask(&self, request: ReplyRequest) -> Option<String> {
        let mut answers = self.answers.lock().await;
        self.requests
            .send(Envelope::ReplyRequest(request))
            .await
            .ok()?;
        loop {
            match answers.recv().await? {
                Envelope::ReplyAnswer(answer) => return Some(answer.message),
                other => warn!(
                    "Telegram listener {} got unexpected {}",
                    self.listener_id,
                    other.kind()
                ),
            }
        }
    }

    fn is_allowed(&self, user_id: u64) -> bool {
        self.allowed_user_ids.is_empty() || self.allowed_user_ids.contains(&user_id)
    }
}

struct Pending {
    bot: Bot,
    input: EnvelopeReceiver,
}

pub struct TelegramListener {
    id: String,
    exchange: Arc<Exchange>,
    input: EnvelopeSender,
    pending: Mutex<Option<Pending>>,
}

impl TelegramListener {
    pub fn new(
        config: &ListenerConfig,
        requests: EnvelopeSender,
        answers: EnvelopeReceiver,
    ) -> Result<Self> {
        let token = config
            .setting_str("token")
            .with_context(|| format!("Telegram listener {} has no token", config.id))?;
        let allowed_user_ids = allowed_user_ids(config)?;

        let (input, input_rx) = channel();
        let exchange = Arc::new(Exchange {
            listener_id: config.id.clone(),
            bot_username: config.username.clone(),
            allowed_user_ids,
            requests,
            answers: tokio::sync::Mutex::new(answers),
        });

        Ok(Self {
            id: config.id.clone(),
            exchange,
            input,
            pending: Mutex::new(Some(Pending {
                bot: Bot::new(token),
                input: input_rx,
            })),
        })
    }
}

impl Listener for TelegramListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self) -> Result<()> {
        let Pending { bot, input } = self
            .pending
            .get_mut()
            .map_err(|_| anyhow::anyhow!("Telegram listener state poisoned"))?
            .take()
            .with_context(|| format!("Telegram listener {} already started", self.id))?;

        info!("Starting Telegram listener {}...", self.id);

        let handler = Update::filter_message().endpoint(handle_message);
        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self.exchange.clone()])
            .default_handler(|upd| async move {
                warn!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
            .build();

        let token: &'static _ = Box::leak(Box::new(dispatcher.shutdown_token()));
        let (dispatched_tx, dispatched) = oneshot::channel();
        tokio::spawn(relay_stop(self.id.clone(), input, dispatched, move || {
            token.shutdown()
        }));

        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            dispatcher.dispatch().await;
            drop(dispatched_tx);
            info!("Telegram listener {} stopped", exchange.listener_id);
            let stopped = Envelope::Stopped {
                listener_id: exchange.listener_id.clone(),
            };
            if exchange.requests.send(stopped).await.is_err() {
                warn!(
                    "Dispatcher went away before Telegram listener {} stopped",
                    exchange.listener_id
                );
            }
        });

        Ok(())
    }

    fn input_channel(&self) -> EnvelopeSender {
        self.input.clone()
    }
}

/// Wait for `Stop` on the input channel, then shut the update dispatcher
/// down. Polling may still be starting up when `Stop` arrives, in which case
/// `shutdown` is retried until it takes or `dispatched` reports the
/// dispatcher has already finished. Returns whether a shutdown was issued.
async fn relay_stop<F, Fut, E>(
    id: String,
    mut input: EnvelopeReceiver,
    mut dispatched: oneshot::Receiver<()>,
    mut shutdown: F,
) -> bool
where
    F: FnMut() -> Result<Fut, E>,
    Fut: Future<Output = ()>,
    E: std::fmt::Display,
{
    loop {
        let envelope = tokio::select! {
            envelope = input.recv() => envelope,
            _ = &mut dispatched => return false,
        };
        match envelope {
            Some(Envelope::Stop) => break,
            Some(other) => warn!(
                "Telegram listener {} ignoring {} on input channel",
                id,
                other.kind()
            ),
            None => return false,
        }
    }

    loop {
        match shutdown() {
            Ok(done) => {
                done.await;
                return true;
            }
            Err(e) => {
                debug!("Telegram listener {} cannot stop yet ({}); retrying", id, e);
                tokio::select! {
                    _ = tokio::time::sleep(SHUTDOWN_RETRY) => {}
                    _ = &mut dispatched => return false,
                }
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, exchange: Arc<Exchange>) -> ResponseResult<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };

    if !exchange.is_allowed(user.id.0) {
        return Ok(());
    }

    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    let username = user
        .username
        .clone()
        .unwrap_or_else(|| user.id.0.to_string());

    info!("Telegram message from {} ({}): {}", username, user.id.0, text);

    // Send "typing" indicator
    bot.send_chat_action(msg.chat.id, teloxide::types::ChatAction::Typing)
        .await
        .ok();

    let request = ReplyRequest {
        listener: exchange.listener_id.clone(),
        username,
        bot_username: exchange.bot_username.clone(),
        message: text,
        group_chat: msg.chat.is_group() || msg.chat.is_supergroup(),
    };

    match exchange.ask(request).await {
        Some(reply) => {
            for chunk in split_message(&reply, MAX_MESSAGE_LEN) {
                bot.send_message(msg.chat.id, chunk).await.ok();
            }
        }
        None => warn!(
            "Telegram listener {} got no answer; dispatcher is gone",
            exchange.listener_id
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ReplyAnswer;

    #[test]
    fn test_short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_prefers_line_breaks() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line\n".to_string(), "second line".to_string()]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_message(&text, 5);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= 5));
    }

    #[test]
    fn test_split_falls_back_to_spaces_then_hard_cut() {
        assert_eq!(
            split_message("aaa bbb ccc", 8),
            vec!["aaa bbb ".to_string(), "ccc".to_string()]
        );
        assert_eq!(
            split_message("abcdefgh", 3),
            vec!["abc".to_string(), "def".to_string(), "gh".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_construction_error() {
        let (req_tx, _req_rx) = channel();
        let (_ans_tx, ans_rx) = channel();
        let config = ListenerConfig::new("tg", KIND);
        let err = TelegramListener::new(&config, req_tx, ans_rx).err().unwrap();
        assert!(err.to_string().contains("has no token"));
    }

    #[test]
    fn test_allowed_user_ids_parsing() {
        let mut config = ListenerConfig::new("tg", KIND);
        assert!(allowed_user_ids(&config).unwrap().is_empty());

        config.settings.insert(
            "allowed_user_ids".to_string(),
            toml::Value::Array(vec![toml::Value::Integer(7), toml::Value::Integer(42)]),
        );
        assert_eq!(allowed_user_ids(&config).unwrap(), vec![7, 42]);

        config.settings.insert(
            "allowed_user_ids".to_string(),
            toml::Value::Array(vec![toml::Value::Integer(-1)]),
        );
        assert!(allowed_user_ids(&config).is_err());
    }

    #[tokio::test]
    async fn test_stop_before_dispatching_is_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (input_tx, input_rx) = channel();
        let (_dispatched_tx, dispatched) = oneshot::channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        input_tx.send(Envelope::Stop).await.unwrap();
        let stopped = relay_stop("tg".to_string(), input_rx, dispatched, move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("dispatcher is idle")
            } else {
                Ok(std::future::ready(()))
            }
        })
        .await;

        assert!(stopped);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_after_dispatch_finished_gives_up() {
        let (input_tx, input_rx) = channel();
        let (dispatched_tx, dispatched) = oneshot::channel::<()>();

        input_tx.send(Envelope::Stop).await.unwrap();
        drop(dispatched_tx);
        let stopped = relay_stop("tg".to_string(), input_rx, dispatched, || {
            Err::<std::future::Ready<()>, _>("dispatcher is idle")
        })
        .await;

        assert!(!stopped);
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (req_tx, mut req_rx) = channel();
        let (ans_tx, ans_rx) = channel();
        let exchange = Arc::new(Exchange {
            listener_id: "tg".to_string(),
            bot_username: "scarecrow_bot".to_string(),
            allowed_user_ids: vec![1],
            requests: req_tx,
            answers: tokio::sync::Mutex::new(ans_rx),
        });
        assert!(exchange.is_allowed(1));
        assert!(!exchange.is_allowed(2));

        let asker = exchange.clone();
        let pending = tokio::spawn(async move {
            asker
                .ask(ReplyRequest {
                    listener: "tg".to_string(),
                    username: "alice".to_string(),
                    bot_username: "scarecrow_bot".to_string(),
                    message: "hi".to_string(),
                    group_chat: true,
                })
                .await
        });

        match req_rx.recv().await.unwrap() {
            Envelope::ReplyRequest(req) => assert!(req.group_chat),
            other => panic!("unexpected envelope: {:?}", other),
        }
        ans_tx
            .send(Envelope::ReplyAnswer(ReplyAnswer {
                username: "alice".to_string(),
                message: "hello alice".to_string(),
            }))
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap().as_deref(), Some("hello alice"));
    }
}
