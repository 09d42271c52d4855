pub mod rules;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::config::BrainConfig;
use crate::llm::{ChatBackend, ChatMessage, LlmClient};
use rules::{load_rules_from_dir, RuleSet};

/// Turns a message plus the sender's routing identity into reply text.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    /// Always returns a non-empty reply.
    async fn reply(&self, bot_username: &str, uid: &str, message: &str, group_chat: bool)
        -> String;

    /// Re-read the engine's rules from disk.
    async fn reload(&self) -> Result<()>;
}

/// Reply engine backed by a chat model, steered by the rule files in the
/// brain directory. Each routing identity gets its own short history.
pub struct LlmBrain {
    backend: Box<dyn ChatBackend>,
    config: BrainConfig,
    rules: RwLock<RuleSet>,
    history: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl LlmBrain {
    pub async fn load(config: BrainConfig) -> Result<Self> {
        let backend = Box::new(LlmClient::new(&config));
        Self::with_backend(config, backend).await
    }

    pub async fn with_backend(config: BrainConfig, backend: Box<dyn ChatBackend>) -> Result<Self> {
        let rules = load_rules_from_dir(&config.rules_directory).await?;
        Ok(Self {
            backend,
            config,
            rules: RwLock::new(rules),
            history: Mutex::new(HashMap::new()),
        })
    }

    fn build_system_prompt(&self, rules: &RuleSet, bot_username: &str, group_chat: bool) -> String {
        let mut prompt = self.config.system_prompt.clone();
        prompt.push_str(&format!("\n\nYour name in this chat is {}.", bot_username));
        if group_chat {
            prompt.push_str(" This message was sent in a group conversation.");
        }

        if !rules.is_empty() {
            prompt.push_str("\n\n# Rules\n\n");
            prompt.push_str(&rules.build_context());
        }
        prompt
    }

    async fn generate(
        &self,
        bot_username: &str,
        uid: &str,
        message: &str,
        group_chat: bool,
    ) -> Result<String> {
        let system_prompt = {
            let rules = self.rules.read().await;
            self.build_system_prompt(&rules, bot_username, group_chat)
        };

        let mut messages = vec![ChatMessage::system(&system_prompt)];
        {
            let history = self.history.lock().await;
            if let Some(past) = history.get(uid) {
                messages.extend(past.iter().cloned());
            }
        }
        messages.push(ChatMessage::user(message));

        let response = self.backend.chat(&messages).await?;
        let content = response.content.unwrap_or_default().trim().to_string();
        if content.is_empty() {
            anyhow::bail!("the model returned an empty reply");
        }

        let mut history = self.history.lock().await;
        let past = history.entry(uid.to_string()).or_default();
        past.push(ChatMessage::user(message));
        past.push(ChatMessage::assistant(&content));
        if past.len() > self.config.history_limit {
            let excess = past.len() - self.config.history_limit;
            past.drain(..excess);
        }

        Ok(content)
    }
}

#[async_trait]
impl ReplyEngine for LlmBrain {
    async fn reply(
        &self,
        bot_username: &str,
        uid: &str,
        message: &str,
        group_chat: bool,
    ) -> String {
        match self.generate(bot_username, uid, message, group_chat).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Error generating reply for {}: {:#}", uid, e);
                format!("Error: {}", e)
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        let rules = load_rules_from_dir(&self.config.rules_directory).await?;
        info!("Brain reloaded with {} rules", rules.len());
        *self.rules.write().await = rules;
        Ok(())
    }
}
