use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use super::{
    channel, EnvelopeReceiver, EnvelopeSender, Listener, ListenerConfig, ListenerRegistry,
};
use crate::envelope::{Envelope, ReplyRequest};

pub const KIND: &str = "console";

type Reader = Box<dyn AsyncBufRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

pub fn register(registry: &mut ListenerRegistry) {
    registry.register(KIND, Box::new(construct));
}

fn construct(
    config: &ListenerConfig,
    requests: EnvelopeSender,
    answers: EnvelopeReceiver,
) -> Result<Box<dyn Listener>> {
    Ok(Box::new(ConsoleListener::new(config, requests, answers)))
}

/// Chat with the bot from a terminal: one line in, one reply out.
pub struct ConsoleListener {
    id: String,
    input: EnvelopeSender,
    session: Mutex<Option<ConsoleSession>>,
}

impl ConsoleListener {
    pub fn new(config: &ListenerConfig, requests: EnvelopeSender, answers: EnvelopeReceiver) -> Self {
        Self::with_io(
            config,
            requests,
            answers,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn with_io(
        config: &ListenerConfig,
        requests: EnvelopeSender,
        answers: EnvelopeReceiver,
        reader: Reader,
        writer: Writer,
    ) -> Self {
        let (input, input_rx) = channel();
        let session = ConsoleSession {
            id: config.id.clone(),
            user: config.setting_str("user").unwrap_or("console").to_string(),
            bot_username: config.username.clone(),
            requests,
            answers,
            input: input_rx,
            reader,
            writer,
        };
        Self {
            id: config.id.clone(),
            input,
            session: Mutex::new(Some(session)),
        }
    }
}

impl Listener for ConsoleListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self) -> Result<()> {
        let session = self
            .session
            .get_mut()
            .map_err(|_| anyhow::anyhow!("Console listener state poisoned"))?
            .take()
            .with_context(|| format!("Console listener {} already started", self.id))?;

        info!("Starting console listener {}", self.id);
        tokio::spawn(session.run());
        Ok(())
    }

    fn input_channel(&self) -> EnvelopeSender {
        self.input.clone()
    }
}

struct ConsoleSession {
    id: String,
    user: String,
    bot_username: String,
    requests: EnvelopeSender,
    answers: EnvelopeReceiver,
    input: EnvelopeReceiver,
    reader: Reader,
    writer: Writer,
}

impl ConsoleSession {
    async fn run(mut self) {
        if let Err(e) = self.converse().await {
            error!("Console listener {} failed: {:#}", self.id, e);
        }

        info!("Console listener {} stopped", self.id);
        let stopped = Envelope::Stopped {
            listener_id: self.id.clone(),
        };
        if self.requests.send(stopped).await.is_err() {
            warn!("Dispatcher went away before console listener {} stopped", self.id);
        }
    }

    async fn converse(&mut self) -> Result<()> {
        let mut line = String::new();
        loop {
            self.prompt().await?;

            tokio::select! {
                envelope = self.input.recv() => match envelope {
                    Some(Envelope::Stop) | None => return Ok(()),
                    Some(other) => {
                        warn!("Console listener {} ignoring {} on input channel", self.id, other.kind());
                        continue;
                    }
                },
                read = self.reader.read_line(&mut line) => {
                    if read.context("Failed to read from console")? == 0 {
                        info!("Console input closed");
                        return Ok(());
                    }
                }
            }

            let text = line.trim_end_matches(['\r', '\n']).to_string();
            line.clear();
            if text.trim().is_empty() {
                continue;
            }

            let request = ReplyRequest {
                listener: self.id.clone(),
                username: self.user.clone(),
                bot_username: self.bot_username.clone(),
                message: text,
                group_chat: false,
            };
            if self.requests.send(Envelope::ReplyRequest(request)).await.is_err() {
                anyhow::bail!("Dispatcher closed the request channel");
            }

            match self.await_answer().await {
                Some(reply) => {
                    let out = format!("{}: {}\n", self.bot_username, reply);
                    self.writer.write_all(out.as_bytes()).await?;
                    self.writer.flush().await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Wait for the reply to the request just sent. `None` means stop.
    async fn await_answer(&mut self) -> Option<String> {
        loop {
            tokio::select! {
                biased;
                answer = self.answers.recv() => match answer {
                    Some(Envelope::ReplyAnswer(answer)) => return Some(answer.message),
                    Some(other) => warn!("Console listener {} got unexpected {}", self.id, other.kind()),
                    None => return None,
                },
                envelope = self.input.recv() => match envelope {
                    Some(Envelope::Stop) | None => return None,
                    Some(other) => warn!("Console listener {} ignoring {} on input channel", self.id, other.kind()),
                },
            }
        }
    }

    async fn prompt(&mut self) -> Result<()> {
        let prompt = format!("{}> ", self.user);
        self.writer.write_all(prompt.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ReplyAnswer;
    use tokio::io::AsyncReadExt;

    fn console_config() -> ListenerConfig {
        let mut config = ListenerConfig::new("console", KIND);
        config
            .settings
            .insert("user".to_string(), toml::Value::String("bob".to_string()));
        config
    }

    #[tokio::test]
    async fn test_lines_become_requests_and_eof_stops() {
        let (req_tx, mut req_rx) = channel();
        let (ans_tx, ans_rx) = channel();
        let (writer, mut output) = tokio::io::duplex(4096);

        let mut listener = ConsoleListener::with_io(
            &console_config(),
            req_tx,
            ans_rx,
            Box::new(&b"hello there\n\n   \nbye\n"[..]),
            Box::new(writer),
        );
        listener.start().unwrap();

        for (expected, reply) in [("hello there", "hi bob"), ("bye", "see you")] {
            match req_rx.recv().await.unwrap() {
                Envelope::ReplyRequest(req) => {
                    assert_eq!(req.listener, "console");
                    assert_eq!(req.username, "bob");
                    assert_eq!(req.bot_username, "scarecrow");
                    assert_eq!(req.message, expected);
                    assert!(!req.group_chat);
                }
                other => panic!("unexpected envelope: {:?}", other),
            }
            ans_tx
                .send(Envelope::ReplyAnswer(ReplyAnswer {
                    username: "bob".to_string(),
                    message: reply.to_string(),
                }))
                .await
                .unwrap();
        }

        assert_eq!(
            req_rx.recv().await.unwrap(),
            Envelope::Stopped {
                listener_id: "console".to_string()
            }
        );

        let mut printed = String::new();
        output.read_to_string(&mut printed).await.unwrap();
        assert!(printed.contains("scarecrow: hi bob\n"));
        assert!(printed.contains("scarecrow: see you\n"));
    }

    #[tokio::test]
    async fn test_stop_ends_session_with_single_stopped() {
        let (req_tx, mut req_rx) = channel();
        let (_ans_tx, ans_rx) = channel();
        // Keep the far end open so the read never completes.
        let (reader, _keep_open) = tokio::io::duplex(64);

        let mut listener = ConsoleListener::with_io(
            &console_config(),
            req_tx,
            ans_rx,
            Box::new(BufReader::new(reader)),
            Box::new(tokio::io::sink()),
        );
        listener.start().unwrap();
        listener.input_channel().send(Envelope::Stop).await.unwrap();

        assert_eq!(
            req_rx.recv().await.unwrap(),
            Envelope::Stopped {
                listener_id: "console".to_string()
            }
        );
        assert!(req_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (req_tx, _req_rx) = channel();
        let (_ans_tx, ans_rx) = channel();
        let (reader, _keep_open) = tokio::io::duplex(64);
        let mut listener = ConsoleListener::with_io(
            &console_config(),
            req_tx,
            ans_rx,
            Box::new(BufReader::new(reader)),
            Box::new(tokio::io::sink()),
        );
        listener.start().unwrap();
        assert!(listener.start().is_err());
    }
}
