use changefeed::types::Record;
use rdkafka::Message;

/// Copy a message received from Kafka into an owned [Record].
/// A missing payload becomes an empty one, the offset is still meaningful.
pub(crate) fn record_from_message<M: Message>(msg: &M) -> Record {
    Record {
        topic: msg.topic().to_owned(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|x| x.to_vec()),
        payload: msg.payload().map(|x| x.to_vec()).unwrap_or_default(),
        timestamp: msg.timestamp().to_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::record_from_message;
    use rdkafka::Timestamp;
    use rdkafka::message::OwnedMessage;

    #[test]
    fn copies_all_fields() {
        let msg = OwnedMessage::new(
            Some(b"value1".to_vec()),
            Some(b"key1".to_vec()),
            "test-topic".to_owned(),
            Timestamp::CreateTime(1_700_000_000_000),
            0,
            1,
            None,
        );
        let record = record_from_message(&msg);
        assert_eq!(record.topic, "test-topic");
        assert_eq!(record.partition, 0);
        assert_eq!(record.offset, 1);
        assert_eq!(record.key.as_deref(), Some(b"key1".as_slice()));
        assert_eq!(record.payload, b"value1");
        assert_eq!(record.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn missing_payload_is_empty() {
        let msg = OwnedMessage::new(
            None,
            None,
            "t".to_owned(),
            Timestamp::NotAvailable,
            3,
            9,
            None,
        );
        let record = record_from_message(&msg);
        assert!(record.payload.is_empty());
        assert_eq!(record.key, None);
        assert_eq!(record.timestamp, None);
    }
}
