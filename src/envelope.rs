/// A listener asking the dispatcher for a reply to one chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    /// Id of the listener the message arrived on
    pub listener: String,
    /// Platform-local name of the person who wrote the message
    pub username: String,
    /// The bot's own name on that platform
    pub bot_username: String,
    /// Raw message text, untrimmed
    pub message: String,
    /// Whether the message came from a group conversation
    pub group_chat: bool,
}

/// The dispatcher's answer to a `ReplyRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAnswer {
    pub username: String,
    pub message: String,
}

/// Unit of traffic on a listener's request/answer channel pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    ReplyRequest(ReplyRequest),
    ReplyAnswer(ReplyAnswer),
    /// Asks a listener to shut down.
    Stop,
    /// A listener confirming it has fully shut down.
    Stopped { listener_id: String },
}

impl Envelope {
    /// Short variant name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ReplyRequest(_) => "reply_request",
            Envelope::ReplyAnswer(_) => "reply_answer",
            Envelope::Stop => "stop",
            Envelope::Stopped { .. } => "stopped",
        }
    }
}
