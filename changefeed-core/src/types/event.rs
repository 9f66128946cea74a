use serde::{Deserialize, Deserializer, Serialize};

/// One decoded change notification from the feed.
///
/// Every field is optional on the wire: absent keys and JSON `null` both decode to the
/// field type's zero value. A value of the wrong JSON type fails the whole line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    /// Envelope data describing where the event came from
    #[serde(deserialize_with = "null_as_default")]
    pub meta: EventMeta,
    /// The change itself, flattened into the top level of the JSON object
    #[serde(flatten)]
    pub change: Change,
}

/// Envelope of an [Event]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMeta {
    /// URI of the changed resource
    #[serde(deserialize_with = "null_as_default")]
    pub uri: String,
    /// Id of the request which caused the change
    #[serde(deserialize_with = "null_as_default")]
    pub request_id: String,
    /// Unique id of this event
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    /// Event timestamp, ISO-8601
    #[serde(deserialize_with = "null_as_default")]
    pub dt: String,
    /// Domain the change happened on
    #[serde(deserialize_with = "null_as_default")]
    pub domain: String,
    /// Name of the source stream
    #[serde(deserialize_with = "null_as_default")]
    pub stream: String,
    /// Topic the event was read from upstream
    #[serde(deserialize_with = "null_as_default")]
    pub topic: String,
    /// Partition the event was read from upstream
    #[serde(deserialize_with = "null_as_default")]
    pub partition: i32,
    /// Offset of the event in the upstream partition
    #[serde(deserialize_with = "null_as_default")]
    pub offset: i64,
}

/// Payload of an [Event]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Change {
    /// Numeric id of the change
    #[serde(deserialize_with = "null_as_default")]
    pub id: i64,
    /// Kind of change, e.g. `edit`, `new`, `log`
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: String,
    /// Numeric namespace of the changed page
    #[serde(deserialize_with = "null_as_default")]
    pub namespace: i64,
    /// Title of the changed page
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    /// Full URL of the changed page
    #[serde(deserialize_with = "null_as_default")]
    pub title_url: String,
    /// Free-text edit comment
    #[serde(deserialize_with = "null_as_default")]
    pub comment: String,
    /// Unix timestamp in seconds
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    /// Name of the user who made the change
    #[serde(deserialize_with = "null_as_default")]
    pub user: String,
    /// Whether the change was made by a bot
    #[serde(deserialize_with = "null_as_default")]
    pub bot: bool,
    /// URL to look at the change
    #[serde(deserialize_with = "null_as_default")]
    pub notify_url: String,
    /// Base URL of the wiki server
    #[serde(deserialize_with = "null_as_default")]
    pub server_url: String,
    /// Host name of the wiki server
    #[serde(deserialize_with = "null_as_default")]
    pub server_name: String,
    /// Script path of the wiki server
    #[serde(deserialize_with = "null_as_default")]
    pub server_script_path: String,
    /// Wiki database name
    #[serde(deserialize_with = "null_as_default")]
    pub wiki: String,
    /// Comment rendered as HTML
    #[serde(rename = "parsedcomment", deserialize_with = "null_as_default")]
    pub parsed_comment: String,
}

impl Event {
    /// One-line human readable rendering used as the default wire value
    pub fn summary(&self) -> String {
        let c = &self.change;
        format!(
            "ID: {}, Type: {}, Title: {}, User: {}, Comment: {}",
            c.id, c.kind, c.title, c.user, c.comment
        )
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
