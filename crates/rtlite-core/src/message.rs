//! rtlite message types and wire codec.
//!
//! Frames are ASCII-delimited: fields are separated by the unit separator
//! (0x1F) and frames are terminated by the record separator (0x1E). The
//! first field is a single topic byte, the second an action code; the
//! remaining fields depend on the action.
//!
//! Names, usernames and correlation ids must not contain either separator.
//! An emit payload is the unparsed remainder of its frame, so it may
//! contain the field separator but never the frame separator; clients
//! encode binary data accordingly.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Field separator within a frame.
pub const FIELD_SEPARATOR: u8 = 0x1F;

/// Frame terminator.
pub const FRAME_SEPARATOR: u8 = 0x1E;

/// Wire-level topic tag (single byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topic {
    Connection = b'C',
    Record = b'R',
    Event = b'E',
    Rpc = b'P',
    Presence = b'U',
    Monitoring = b'M',
}

impl TryFrom<u8> for Topic {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            b'C' => Ok(Topic::Connection),
            b'R' => Ok(Topic::Record),
            b'E' => Ok(Topic::Event),
            b'P' => Ok(Topic::Rpc),
            b'U' => Ok(Topic::Presence),
            b'M' => Ok(Topic::Monitoring),
            other => Err(ProtocolError::InvalidTopic(other)),
        }
    }
}

impl Topic {
    /// The single wire byte for this topic.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Logical subscription namespace served by one registry instance.
///
/// The listen-pattern variants share their parent's wire topic but carry a
/// different default action table, which is why they are distinct here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryTopic {
    Record,
    Event,
    Rpc,
    Presence,
    Monitoring,
    RecordListenPatterns,
    EventListenPatterns,
}

/// All registry topics, in the order registries are constructed.
pub const REGISTRY_TOPICS: [RegistryTopic; 7] = [
    RegistryTopic::Record,
    RegistryTopic::Event,
    RegistryTopic::Rpc,
    RegistryTopic::Presence,
    RegistryTopic::Monitoring,
    RegistryTopic::RecordListenPatterns,
    RegistryTopic::EventListenPatterns,
];

impl RegistryTopic {
    /// The wire topic frames for this registry carry.
    pub fn wire_topic(self) -> Topic {
        match self {
            RegistryTopic::Record | RegistryTopic::RecordListenPatterns => Topic::Record,
            RegistryTopic::Event | RegistryTopic::EventListenPatterns => Topic::Event,
            RegistryTopic::Rpc => Topic::Rpc,
            RegistryTopic::Presence => Topic::Presence,
            RegistryTopic::Monitoring => Topic::Monitoring,
        }
    }

    /// Cluster-state topic under which local presence for this registry is
    /// replicated. Registries sharing a state topic share one state registry.
    pub fn state_topic(self) -> &'static str {
        match self {
            RegistryTopic::Record => "record-subscriptions",
            RegistryTopic::Event => "event-subscriptions",
            RegistryTopic::Rpc => "rpc-providers",
            RegistryTopic::Presence => "presence-subscriptions",
            RegistryTopic::Monitoring => "monitoring-subscriptions",
            RegistryTopic::RecordListenPatterns => "record-listen-patterns",
            RegistryTopic::EventListenPatterns => "event-listen-patterns",
        }
    }

    /// Default subscribe action for this registry.
    pub fn subscribe_action(self) -> Action {
        match self {
            RegistryTopic::RecordListenPatterns | RegistryTopic::EventListenPatterns => {
                Action::Listen
            }
            _ => Action::Subscribe,
        }
    }

    /// Default unsubscribe action for this registry.
    pub fn unsubscribe_action(self) -> Action {
        match self {
            RegistryTopic::RecordListenPatterns | RegistryTopic::EventListenPatterns => {
                Action::Unlisten
            }
            _ => Action::Unsubscribe,
        }
    }

    /// Short label for log lines.
    pub fn label(self) -> &'static str {
        match self {
            RegistryTopic::Record => "record",
            RegistryTopic::Event => "event",
            RegistryTopic::Rpc => "rpc",
            RegistryTopic::Presence => "presence",
            RegistryTopic::Monitoring => "monitoring",
            RegistryTopic::RecordListenPatterns => "record-listen",
            RegistryTopic::EventListenPatterns => "event-listen",
        }
    }
}

/// Wire action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Connection handshake carrying the username.
    Hello,
    /// Acknowledgement echoing a request.
    Ack,
    Subscribe,
    Unsubscribe,
    SubscribeBulk,
    UnsubscribeBulk,
    Listen,
    Unlisten,
    /// Publish to all subscribers of a name.
    Emit,
    /// Reply to a duplicate subscribe.
    MultipleSubscriptions,
    /// Reply to an unsubscribe of an unknown or unsubscribed name.
    NotSubscribed,
    /// Generic error reply.
    Error,
}

impl Action {
    /// The wire code for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Hello => "HI",
            Action::Ack => "A",
            Action::Subscribe => "S",
            Action::Unsubscribe => "US",
            Action::SubscribeBulk => "SB",
            Action::UnsubscribeBulk => "USB",
            Action::Listen => "L",
            Action::Unlisten => "UL",
            Action::Emit => "EVT",
            Action::MultipleSubscriptions => "MS",
            Action::NotSubscribed => "NS",
            Action::Error => "ERR",
        }
    }

    fn from_code(code: &str) -> std::result::Result<Self, ProtocolError> {
        match code {
            "HI" => Ok(Action::Hello),
            "A" => Ok(Action::Ack),
            "S" => Ok(Action::Subscribe),
            "US" => Ok(Action::Unsubscribe),
            "SB" => Ok(Action::SubscribeBulk),
            "USB" => Ok(Action::UnsubscribeBulk),
            "L" => Ok(Action::Listen),
            "UL" => Ok(Action::Unlisten),
            "EVT" => Ok(Action::Emit),
            "MS" => Ok(Action::MultipleSubscriptions),
            "NS" => Ok(Action::NotSubscribed),
            "ERR" => Ok(Action::Error),
            other => Err(ProtocolError::InvalidAction(other.to_string())),
        }
    }

    /// Whether frames with this action carry an echoed original action as
    /// their first data field.
    fn carries_original(self) -> bool {
        matches!(
            self,
            Action::Ack | Action::MultipleSubscriptions | Action::NotSubscribed
        )
    }

    /// Whether this action addresses multiple names in one frame.
    fn is_bulk(self) -> bool {
        matches!(self, Action::SubscribeBulk | Action::UnsubscribeBulk)
    }
}

/// A decoded protocol message.
///
/// `name` is the subscription name for single-name actions; bulk actions
/// carry `names` and a `correlation_id` instead. Replies (`Ack`,
/// `MultipleSubscriptions`, `NotSubscribed`) echo the request's action in
/// `original_action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub original_action: Option<Action>,
    pub name: String,
    pub names: Vec<String>,
    pub correlation_id: Option<String>,
    pub payload: Option<Bytes>,
}

impl Message {
    /// A single-name request or notification.
    pub fn new(topic: Topic, action: Action, name: impl Into<String>) -> Self {
        Self {
            topic,
            action,
            original_action: None,
            name: name.into(),
            names: Vec::new(),
            correlation_id: None,
            payload: None,
        }
    }

    /// A bulk request addressing several names under one correlation id.
    pub fn bulk(
        topic: Topic,
        action: Action,
        names: Vec<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            topic,
            action,
            original_action: None,
            name: String::new(),
            names,
            correlation_id: Some(correlation_id.into()),
            payload: None,
        }
    }

    /// An emit frame carrying a payload for fanout.
    pub fn emit(topic: Topic, name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic,
            action: Action::Emit,
            original_action: None,
            name: name.into(),
            names: Vec::new(),
            correlation_id: None,
            payload: Some(payload),
        }
    }

    /// Build the acknowledgement for a request, echoing its action and
    /// either its name or, for bulk requests, its correlation id.
    pub fn ack(request: &Message) -> Self {
        Self {
            topic: request.topic,
            action: Action::Ack,
            original_action: Some(request.action),
            name: if request.action.is_bulk() {
                String::new()
            } else {
                request.name.clone()
            },
            names: Vec::new(),
            correlation_id: if request.action.is_bulk() {
                request.correlation_id.clone()
            } else {
                None
            },
            payload: None,
        }
    }

    /// Encode this message into `buf`, including the trailing frame
    /// separator. Encoding is a pure function of the message, so every
    /// subscriber in a fanout shares the same byte representation.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.topic.as_byte());
        buf.push(FIELD_SEPARATOR);
        buf.extend_from_slice(self.action.as_str().as_bytes());
        if let Some(original) = self.original_action {
            buf.push(FIELD_SEPARATOR);
            buf.extend_from_slice(original.as_str().as_bytes());
        }
        if self.action.is_bulk() || (self.action == Action::Ack && self.correlation_id.is_some()) {
            buf.push(FIELD_SEPARATOR);
            buf.extend_from_slice(
                self.correlation_id.as_deref().unwrap_or_default().as_bytes(),
            );
            for name in &self.names {
                buf.push(FIELD_SEPARATOR);
                buf.extend_from_slice(name.as_bytes());
            }
        } else if !self.name.is_empty() {
            buf.push(FIELD_SEPARATOR);
            buf.extend_from_slice(self.name.as_bytes());
        }
        if let Some(ref payload) = self.payload {
            buf.push(FIELD_SEPARATOR);
            buf.extend_from_slice(payload);
        }
        buf.push(FRAME_SEPARATOR);
    }

    /// Encode into a freshly allocated frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.payload.as_ref().map_or(0, |p| p.len()));
        self.encode(&mut buf);
        buf
    }

    /// Parse a single frame. `frame` must not include the trailing frame
    /// separator.
    pub fn parse(frame: &[u8]) -> std::result::Result<Message, ProtocolError> {
        let mut fields = frame.split(|&b| b == FIELD_SEPARATOR);

        let topic_field = fields.next().filter(|f| !f.is_empty()).ok_or(ProtocolError::EmptyFrame)?;
        if topic_field.len() != 1 {
            return Err(ProtocolError::InvalidTopic(topic_field[0]));
        }
        let topic = Topic::try_from(topic_field[0])?;

        let action_field = fields.next().ok_or(ProtocolError::MissingField("action"))?;
        let action_code =
            std::str::from_utf8(action_field).map_err(|_| ProtocolError::InvalidUtf8)?;
        let action = Action::from_code(action_code)?;

        let mut message = Message {
            topic,
            action,
            original_action: None,
            name: String::new(),
            names: Vec::new(),
            correlation_id: None,
            payload: None,
        };

        if action.carries_original() {
            let field = fields.next().ok_or(ProtocolError::MissingField("originalAction"))?;
            let code = std::str::from_utf8(field).map_err(|_| ProtocolError::InvalidUtf8)?;
            message.original_action = Some(Action::from_code(code)?);
        }

        match action {
            Action::Hello => {
                message.name = utf8_field(fields.next(), "username")?;
            }
            Action::SubscribeBulk | Action::UnsubscribeBulk => {
                message.correlation_id = Some(utf8_field(fields.next(), "correlationId")?);
                for field in fields {
                    if field.is_empty() {
                        return Err(ProtocolError::MissingField("name"));
                    }
                    message.names.push(
                        std::str::from_utf8(field)
                            .map_err(|_| ProtocolError::InvalidUtf8)?
                            .to_string(),
                    );
                }
                if message.names.is_empty() {
                    return Err(ProtocolError::MissingField("names"));
                }
            }
            Action::Ack => {
                // Bulk acks echo the correlation id instead of a name.
                let field = utf8_field(fields.next(), "name")?;
                if message.original_action.is_some_and(Action::is_bulk) {
                    message.correlation_id = Some(field);
                } else {
                    message.name = field;
                }
            }
            Action::Emit => {
                let name_field = fields.next().ok_or(ProtocolError::MissingField("name"))?;
                message.name = std::str::from_utf8(name_field)
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_string();
                // The payload is the unparsed remainder of the frame, so it
                // may itself contain field separator bytes.
                let payload_start = 1 + 1 + action_field.len() + 1 + name_field.len() + 1;
                if frame.len() < payload_start {
                    return Err(ProtocolError::MissingField("payload"));
                }
                message.payload = Some(Bytes::copy_from_slice(&frame[payload_start..]));
            }
            Action::Error => {
                message.name = utf8_field(fields.next(), "message")?;
            }
            _ => {
                message.name = utf8_field(fields.next(), "name")?;
            }
        }

        Ok(message)
    }
}

fn utf8_field(
    field: Option<&[u8]>,
    what: &'static str,
) -> std::result::Result<String, ProtocolError> {
    let field = field.ok_or(ProtocolError::MissingField(what))?;
    Ok(std::str::from_utf8(field)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string())
}
