use snafu::{ResultExt, ensure};
use threadline_llm::{ResponsePacket, answer_text};
use threadline_storage::{
    AttachmentRecord, ConversationRecord, MessageRecord, MessageRole, MetricsRecord,
};

use super::error::{EncodePacketsSnafu, NotPersistableSnafu, SyncResult};
use super::model::{Attachment, Content, Delivery, GenerationMetrics, Message, Thread};
use super::runtime::IdentityKey;

/// Counters collected while decoding archived threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Assistant messages rewrapped from bare text into a single answer packet.
    pub repaired_messages: usize,
}

pub fn decode_message(record: &MessageRecord, stats: &mut DecodeStats) -> Message {
    let content = match (&record.packets_json, record.role) {
        (Some(raw), _) => match serde_json::from_str::<Vec<ResponsePacket>>(raw) {
            Ok(packets) => Content::Packets(packets),
            Err(error) => {
                tracing::warn!(
                    message_id = %record.id,
                    error = %error,
                    "stored packets are unreadable, falling back to message text"
                );
                stats.repaired_messages += 1;
                legacy_content(record)
            }
        },
        (None, MessageRole::Assistant) => {
            if !record.content.is_empty() {
                stats.repaired_messages += 1;
            }
            legacy_content(record)
        }
        (None, MessageRole::User | MessageRole::System) => Content::Text(record.content.clone()),
    };

    Message {
        id: record.id.clone(),
        role: record.role,
        content,
        timestamp_ms: record.timestamp_ms,
        attachments: record
            .attachments
            .iter()
            .map(|attachment| Attachment {
                name: attachment.name.clone(),
                size_bytes: attachment.size_bytes,
                kind: attachment.kind.clone(),
            })
            .collect(),
        transient_state: None,
        generation_metrics: record.metrics.as_ref().map(|metrics| GenerationMetrics {
            elapsed_ms: metrics.elapsed_ms,
            reasoning_trace: metrics.reasoning_trace.clone(),
        }),
        delivery: Delivery::Persisted,
    }
}

fn legacy_content(record: &MessageRecord) -> Content {
    match record.role {
        MessageRole::Assistant if record.content.is_empty() => Content::Packets(Vec::new()),
        MessageRole::Assistant => {
            Content::Packets(vec![ResponsePacket::answer(record.content.clone())])
        }
        MessageRole::User | MessageRole::System => Content::Text(record.content.clone()),
    }
}

/// Converts an archived conversation into a thread. `identity_key` overrides the stored
/// key when the thread was matched by a weaker rule.
pub fn decode_thread(
    record: ConversationRecord,
    identity_key: Option<IdentityKey>,
    stats: &mut DecodeStats,
) -> Thread {
    let mut messages = record
        .messages
        .iter()
        .map(|message| decode_message(message, stats))
        .collect::<Vec<_>>();
    messages.sort_by_key(|message| message.timestamp_ms);

    let identity_key = identity_key.or_else(|| {
        record
            .identity_key
            .as_deref()
            .and_then(IdentityKey::new)
    });

    Thread {
        id: record.id,
        title: record.title,
        messages,
        identity_key,
        is_canonical: record.is_canonical,
        created_at_ms: record.created_at_ms,
        updated_at_ms: record.updated_at_ms.max(record.created_at_ms),
        archived: record.archived,
        persisted: true,
    }
}

/// Converts a settled message into its archive shape.
///
/// Packet messages store their packets as JSON plus the joined answer text.
pub fn encode_message(message: &Message) -> SyncResult<MessageRecord> {
    ensure!(
        message.is_persistable(),
        NotPersistableSnafu {
            stage: "encode-message",
            message_id: message.id.clone(),
        }
    );

    let (content, packets_json) = match &message.content {
        Content::Text(text) => (text.clone(), None),
        Content::Packets(packets) => {
            let encoded = serde_json::to_string(packets).context(EncodePacketsSnafu {
                stage: "encode-message-packets",
            })?;
            (answer_text(packets), Some(encoded))
        }
    };

    Ok(MessageRecord {
        id: message.id.clone(),
        role: message.role,
        content,
        packets_json,
        timestamp_ms: message.timestamp_ms,
        attachments: message
            .attachments
            .iter()
            .map(|attachment| AttachmentRecord {
                name: attachment.name.clone(),
                size_bytes: attachment.size_bytes,
                kind: attachment.kind.clone(),
            })
            .collect(),
        metrics: message
            .generation_metrics
            .as_ref()
            .map(|metrics| MetricsRecord {
                elapsed_ms: metrics.elapsed_ms,
                reasoning_trace: metrics.reasoning_trace.clone(),
            }),
    })
}

#[cfg(test)]
mod tests {
    use threadline_storage::{MessageId, ThreadId};

    use super::*;
    use crate::error::SyncError;

    fn record(role: MessageRole, content: &str, packets_json: Option<&str>) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            role,
            content: content.to_string(),
            packets_json: packets_json.map(str::to_string),
            timestamp_ms: 10,
            attachments: Vec::new(),
            metrics: None,
        }
    }

    #[test]
    fn legacy_assistant_text_is_wrapped_in_one_answer_packet() {
        let mut stats = DecodeStats::default();
        let message = decode_message(&record(MessageRole::Assistant, "hi there", None), &mut stats);

        assert_eq!(
            message.content,
            Content::Packets(vec![ResponsePacket::answer("hi there")])
        );
        assert_eq!(stats.repaired_messages, 1);
        assert_eq!(message.delivery, Delivery::Persisted);
    }

    #[test]
    fn user_text_stays_plain() {
        let mut stats = DecodeStats::default();
        let message = decode_message(&record(MessageRole::User, "hello", None), &mut stats);
        assert_eq!(message.content, Content::Text("hello".to_string()));
        assert_eq!(stats.repaired_messages, 0);
    }

    #[test]
    fn stored_packets_take_precedence_over_text() {
        let mut stats = DecodeStats::default();
        let raw = r#"[{"type":"answer","content":"from packets"}]"#;
        let message = decode_message(
            &record(MessageRole::Assistant, "from text", Some(raw)),
            &mut stats,
        );
        assert_eq!(
            message.content,
            Content::Packets(vec![ResponsePacket::answer("from packets")])
        );
        assert_eq!(stats.repaired_messages, 0);
    }

    #[test]
    fn unreadable_packets_fall_back_to_text() {
        let mut stats = DecodeStats::default();
        let message = decode_message(
            &record(MessageRole::Assistant, "salvaged", Some("{not json")),
            &mut stats,
        );
        assert_eq!(message.text(), "salvaged");
        assert_eq!(stats.repaired_messages, 1);
    }

    #[test]
    fn encoded_packets_keep_joined_answer_text() {
        let mut message = Message::placeholder(MessageId::new_v7(), 3);
        message.transient_state = None;
        message.content = Content::Packets(vec![
            ResponsePacket::answer("one"),
            ResponsePacket::error("ignored"),
            ResponsePacket::answer("two"),
        ]);

        let encoded = encode_message(&message).expect("encode");
        assert_eq!(encoded.content, "one\n\ntwo");
        assert!(encoded.packets_json.is_some());
    }

    #[test]
    fn synthetic_messages_are_refused() {
        let message = Message::synthetic(MessageId::new_v7(), ResponsePacket::answer("hey"), 1);
        assert!(matches!(
            encode_message(&message),
            Err(SyncError::NotPersistable { .. })
        ));
    }

    #[test]
    fn decoded_threads_sort_messages_and_adopt_matched_key() {
        let mut late = record(MessageRole::Assistant, "late", None);
        late.timestamp_ms = 20;
        let early = record(MessageRole::User, "early", None);
        let conversation = ConversationRecord {
            id: ThreadId::new_v7(),
            owner_key: "owner".to_string(),
            title: "Chat".to_string(),
            identity_key: None,
            construct_id: Some("lin-001".to_string()),
            is_canonical: false,
            archived: false,
            created_at_ms: 1,
            updated_at_ms: 20,
            deleted_at_ms: None,
            messages: vec![late, early],
        };

        let mut stats = DecodeStats::default();
        let key = IdentityKey::new("lin-001");
        let thread = decode_thread(conversation, key.clone(), &mut stats);

        assert_eq!(thread.messages[0].text(), "early");
        assert_eq!(thread.identity_key, key);
        assert!(thread.persisted);
    }
}
