use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::admins::AdminRegistry;
use crate::brain::ReplyEngine;
use crate::commands::{self, Command};
use crate::envelope::{Envelope, ReplyAnswer, ReplyRequest};
use crate::listeners::{
    channel, EnvelopeReceiver, EnvelopeSender, Listener, ListenerConfig, ListenerRegistry,
};
use crate::storage::transactions::{Transaction, TransactionLog};
use crate::storage::Storage;

/// Per-user key: the listener id plus the lowercased platform username, so
/// the same person on two listeners is two identities.
pub fn routing_identity(listener_id: &str, username: &str) -> String {
    format!("{}-{}", listener_id, username.to_lowercase())
}

/// The reply to one request, and whether the shutdown broadcast should run
/// once that reply has been handed back to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledMessage {
    pub reply: String,
    pub shutdown: bool,
}

impl HandledMessage {
    fn answer(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            shutdown: false,
        }
    }
}

struct ActiveListener {
    kind: String,
    input: EnvelopeSender,
    // Owns the listener for as long as it is active.
    _listener: Box<dyn Listener>,
}

/// Owns every active listener and routes their requests to the reply engine.
pub struct Dispatcher {
    engine: Arc<dyn ReplyEngine>,
    admins: AdminRegistry,
    transactions: Arc<dyn TransactionLog>,
    storage: Storage,
    registry: ListenerRegistry,
    listeners: RwLock<HashMap<String, ActiveListener>>,
    finished: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn ReplyEngine>,
        admins: AdminRegistry,
        transactions: Arc<dyn TransactionLog>,
        storage: Storage,
        registry: ListenerRegistry,
    ) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            admins,
            transactions,
            storage,
            registry,
            listeners: RwLock::new(HashMap::new()),
            finished,
        })
    }

    /// Bring up every enabled registration, in order.
    ///
    /// Returns an error only for a duplicate listener id, which is checked
    /// before any listener is built. Unknown types and listeners that fail to
    /// start are logged and skipped.
    pub async fn start_all_bots(self: &Arc<Self>, registrations: &[ListenerConfig]) -> Result<()> {
        if !self.storage.ready() {
            warn!("Not connecting the bots; database isn't ready.");
            return Ok(());
        }

        let enabled: Vec<&ListenerConfig> = registrations.iter().filter(|l| l.enabled).collect();

        // Held until every listener is in the table, so a `Stopped` sent from
        // inside `start()` is handled only once its entry exists.
        let mut active = self.listeners.write().await;

        let mut seen = HashSet::new();
        for registration in &enabled {
            let id = registration.id.as_str();
            if active.contains_key(id) || !seen.insert(id) {
                anyhow::bail!(
                    "Duplicate listener ID '{}'; all listeners should have a unique ID!",
                    id
                );
            }
        }

        for registration in enabled {
            info!(
                "Setting up {} listener {}...",
                registration.kind, registration.id
            );

            let (requests_tx, requests_rx) = channel();
            let (answers_tx, answers_rx) = channel();

            let mut listener = match self.registry.create(
                &registration.kind,
                registration,
                requests_tx,
                answers_rx,
            ) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Skipping listener {}: {:#}", registration.id, e);
                    continue;
                }
            };

            tokio::spawn(
                self.clone()
                    .route(registration.id.clone(), requests_rx, answers_tx),
            );

            // A listener that fails here is dropped, which closes its request
            // channel and ends the routing task spawned above.
            if let Err(e) = listener.start() {
                error!("Failed to start listener {}: {:#}", registration.id, e);
                continue;
            }

            info!("Listener {} is up", listener.id());
            let input = listener.input_channel();
            active.insert(
                registration.id.clone(),
                ActiveListener {
                    kind: registration.kind.clone(),
                    input,
                    _listener: listener,
                },
            );
        }

        Ok(())
    }

    /// Routing task for one listener: the only reader of its request channel
    /// and the only writer of its answer channel.
    async fn route(
        self: Arc<Self>,
        listener_id: String,
        mut requests: EnvelopeReceiver,
        answers: EnvelopeSender,
    ) {
        while let Some(envelope) = requests.recv().await {
            match envelope {
                Envelope::ReplyRequest(request) => {
                    let handled = self.on_message(&request).await;
                    let answer = Envelope::ReplyAnswer(ReplyAnswer {
                        username: request.username,
                        message: handled.reply,
                    });
                    if answers.send(answer).await.is_err() {
                        warn!("Listener {} went away before its answer was delivered", listener_id);
                    }
                    if handled.shutdown {
                        self.shutdown().await;
                    }
                }
                Envelope::Stopped { listener_id } => {
                    self.on_stopped(&listener_id).await;
                    return;
                }
                other => {
                    error!(
                        "Received an unknown event type from listener {}: {:?}",
                        listener_id, other
                    );
                }
            }
        }
        debug!("Request channel for listener {} closed", listener_id);
    }

    /// Produce the reply for one request, running operator commands for admins.
    pub async fn on_message(&self, request: &ReplyRequest) -> HandledMessage {
        debug!(
            "Got reply request from {}: {}",
            request.username, request.message
        );

        let uid = routing_identity(&request.listener, &request.username);
        let input = request.message.trim();

        let command = if self.admins.contains(&uid).await {
            commands::parse(input)
        } else {
            None
        };

        match command {
            Some(command) => {
                let handled = self.run_command(command, input).await;
                let transaction = Transaction {
                    uid,
                    input: input.to_string(),
                    bot_username: request.bot_username.clone(),
                    reply: handled.reply.clone(),
                };
                if let Err(e) = self.transactions.log(&transaction).await {
                    warn!("Failed to record transaction: {:#}", e);
                }
                handled
            }
            None => HandledMessage::answer(
                self.engine
                    .reply(
                        &request.bot_username,
                        &uid,
                        &request.message,
                        request.group_chat,
                    )
                    .await,
            ),
        }
    }

    async fn run_command(&self, command: Command, input: &str) -> HandledMessage {
        match command {
            Command::Reload => {
                if let Err(e) = self.engine.reload().await {
                    error!("Failed to reload the brain: {:#}", e);
                }
                HandledMessage::answer("Brain reloaded!")
            }
            Command::Op(name) => {
                if let Err(e) = self.admins.add(&name).await {
                    error!("Failed to save admins list: {:#}", e);
                }
                HandledMessage::answer(format!("{} added to the admins list.", name))
            }
            Command::Deop(name) => {
                if let Err(e) = self.admins.remove(&name).await {
                    error!("Failed to save admins list: {:#}", e);
                }
                HandledMessage::answer(format!("{} removed from the admins list.", name))
            }
            Command::Halt => {
                info!("Halt requested by admin user.");
                HandledMessage {
                    reply: "Shutting down...".to_string(),
                    shutdown: true,
                }
            }
            Command::SyntaxError => {
                warn!("Syntax error parsing command: {}", input);
                HandledMessage::answer("Syntax error.")
            }
        }
    }

    /// A listener confirmed it has shut down.
    async fn on_stopped(&self, listener_id: &str) {
        let mut listeners = self.listeners.write().await;
        let Some(stopped) = listeners.remove(listener_id) else {
            warn!("Unknown listener {} reported it has stopped", listener_id);
            return;
        };

        info!(
            "Listener {} ({}) has stopped. {} listeners still active.",
            listener_id,
            stopped.kind,
            listeners.len()
        );

        if listeners.is_empty() {
            info!("All listeners have stopped. Exiting the program...");
            self.finished.send_replace(true);
        }
    }

    /// Ask every active listener to stop. Does not wait for them; each one
    /// confirms later with `Stopped` on its own request channel.
    pub async fn shutdown(&self) {
        let listeners = self.listeners.read().await;
        for (id, active) in listeners.iter() {
            info!("Send shutdown request to listener: {}", id);
            let input = active.input.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if input.send(Envelope::Stop).await.is_err() {
                    warn!("Listener {} is no longer accepting input", id);
                }
            });
        }
    }

    /// Ids of the listeners currently active, sorted.
    pub async fn active_listeners(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once every listener that was started has confirmed it stopped.
    pub async fn wait_for_termination(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}
