use super::Event;

/// The unit handed to the broker. Topic and partition are implied by the connection
/// it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Optional message key
    pub key: Option<Vec<u8>>,
    /// Message value, never empty for messages built from an [Event]
    pub value: Vec<u8>,
}

impl WireMessage {
    /// Render an event according to the given value format and key strategy
    pub fn from_event(
        event: &Event,
        format: ValueFormat,
        key: KeyStrategy,
    ) -> Result<Self, serde_json::Error> {
        let value = match format {
            ValueFormat::Summary => event.summary().into_bytes(),
            ValueFormat::Json => serde_json::to_vec(event)?,
        };
        Ok(Self {
            key: key.key_for(event),
            value,
        })
    }

    /// Value as text, invalid UTF-8 replaced
    pub fn value_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// How an [Event] is rendered into the message value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueFormat {
    /// `ID: <id>, Type: <type>, Title: <title>, User: <user>, Comment: <comment>`
    #[default]
    Summary,
    /// The full event as JSON
    Json,
}

/// Which event field, if any, becomes the message key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Messages carry no key
    #[default]
    None,
    /// Key by wiki database name
    Wiki,
    /// Key by the domain in the event envelope
    Domain,
}

impl KeyStrategy {
    fn key_for(&self, event: &Event) -> Option<Vec<u8>> {
        let source = match self {
            KeyStrategy::None => return None,
            KeyStrategy::Wiki => &event.change.wiki,
            KeyStrategy::Domain => &event.meta.domain,
        };
        (!source.is_empty()).then(|| source.as_bytes().to_vec())
    }
}
