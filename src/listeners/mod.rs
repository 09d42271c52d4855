pub mod console;
pub mod telegram;

use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::envelope::Envelope;

pub type EnvelopeSender = mpsc::Sender<Envelope>;
pub type EnvelopeReceiver = mpsc::Receiver<Envelope>;

/// A single slot per channel keeps every hand-off between a listener and the
/// dispatcher close to a rendezvous.
pub const CHANNEL_CAPACITY: usize = 1;

/// Allocate one side of a listener's channel pair.
pub fn channel() -> (EnvelopeSender, EnvelopeReceiver) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// One `[[listeners]]` registration from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    /// The bot's own name on this transport
    #[serde(default = "default_bot_username")]
    pub username: String,
    /// Transport-specific settings
    #[serde(default)]
    pub settings: toml::Table,
}

fn default_bot_username() -> String {
    "scarecrow".to_string()
}

impl ListenerConfig {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            enabled: true,
            username: default_bot_username(),
            settings: toml::Table::new(),
        }
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// A connector between one chat transport and the dispatcher.
///
/// Listeners push `ReplyRequest`s and finally one `Stopped` on the request
/// channel they were built with, and read `ReplyAnswer`s from the answer
/// channel. Shutdown is requested by sending `Envelope::Stop` to
/// [`Listener::input_channel`].
pub trait Listener: Send + Sync {
    fn id(&self) -> &str;

    /// Spawn the listener's background tasks. Must not block.
    fn start(&mut self) -> Result<()>;

    /// Channel the dispatcher delivers `Stop` on.
    fn input_channel(&self) -> EnvelopeSender;
}

/// Builds a listener from its registration, the request sender and the
/// answer receiver.
pub type ListenerConstructor = Box<
    dyn Fn(&ListenerConfig, EnvelopeSender, EnvelopeReceiver) -> Result<Box<dyn Listener>>
        + Send
        + Sync,
>;

/// Transport type name → constructor.
pub struct ListenerRegistry {
    constructors: HashMap<String, ListenerConstructor>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every transport shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        console::register(&mut registry);
        telegram::register(&mut registry);
        registry
    }

    /// Register a constructor. A later registration for the same kind replaces
    /// the earlier one.
    pub fn register(&mut self, kind: &str, constructor: ListenerConstructor) {
        info!("Registered listener type: {}", kind);
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn create(
        &self,
        kind: &str,
        config: &ListenerConfig,
        requests: EnvelopeSender,
        answers: EnvelopeReceiver,
    ) -> Result<Box<dyn Listener>> {
        match self.constructors.get(kind) {
            Some(constructor) => constructor(config, requests, answers),
            None => anyhow::bail!("Unknown listener type: {}", kind),
        }
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert {
        id: String,
        input: EnvelopeSender,
    }

    impl Listener for Inert {
        fn id(&self) -> &str {
            &self.id
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn input_channel(&self) -> EnvelopeSender {
            self.input.clone()
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = ListenerRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["console", "telegram"]);
    }

    #[tokio::test]
    async fn test_create_unknown_kind_fails() {
        let registry = ListenerRegistry::new();
        let (req_tx, _req_rx) = channel();
        let (_ans_tx, ans_rx) = channel();
        let config = ListenerConfig::new("x", "carrier-pigeon");

        let err = registry
            .create("carrier-pigeon", &config, req_tx, ans_rx)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown listener type: carrier-pigeon"));
    }

    #[tokio::test]
    async fn test_create_uses_registered_constructor() {
        let mut registry = ListenerRegistry::new();
        registry.register(
            "inert",
            Box::new(
                |config: &ListenerConfig,
                 _: EnvelopeSender,
                 _: EnvelopeReceiver|
                 -> Result<Box<dyn Listener>> {
                    let (input, _) = channel();
                    Ok(Box::new(Inert {
                        id: config.id.clone(),
                        input,
                    }))
                },
            ),
        );

        let (req_tx, _req_rx) = channel();
        let (_ans_tx, ans_rx) = channel();
        let config = ListenerConfig::new("first", "inert");
        let listener = registry.create("inert", &config, req_tx, ans_rx).unwrap();
        assert_eq!(listener.id(), "first");
    }

    #[test]
    fn test_setting_str_ignores_non_strings() {
        let mut config = ListenerConfig::new("c", "console");
        config
            .settings
            .insert("user".to_string(), toml::Value::String("bob".to_string()));
        config
            .settings
            .insert("port".to_string(), toml::Value::Integer(42));
        assert_eq!(config.setting_str("user"), Some("bob"));
        assert_eq!(config.setting_str("port"), None);
        assert_eq!(config.setting_str("missing"), None);
    }
}
