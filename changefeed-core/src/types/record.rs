use std::fmt::Display;

use bon::Builder;

/// A single record as read back from the broker
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(on(String, into))]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    /// Broker tracked offset of this record within its partition
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    #[builder(default)]
    pub payload: Vec<u8>,
    /// Broker timestamp in milliseconds, if the broker provided one
    pub timestamp: Option<i64>,
}

impl Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self
            .key
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        write!(
            f,
            "{}/{}@{}: {} = {}",
            self.topic,
            self.partition,
            self.offset,
            key,
            String::from_utf8_lossy(&self.payload)
        )
    }
}
