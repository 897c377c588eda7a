//! Property-based tests for the JSON frame codec.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never causes a panic in `decode_inbound`.
//! 2. Objects with an unrecognized `type` tag are preserved as `Other`
//!    with the same tag.
//! 3. Any `send_message` frame survives the client encode / server decode path.

use chrono::{DateTime, Utc};
use deskline_proto::frame::{self, EventType, InboundFrame, OutboundFrame, SendMessageFrame};
use deskline_proto::message::{MessageId, SenderRole, SessionId, UserId};
use proptest::prelude::*;

fn arb_sender() -> impl Strategy<Value = SenderRole> {
    prop_oneof![
        Just(SenderRole::User),
        Just(SenderRole::Admin),
        Just(SenderRole::System),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800_000).prop_map(|ms| DateTime::from_timestamp_millis(ms).unwrap_or_default())
}

fn arb_send_message() -> impl Strategy<Value = OutboundFrame> {
    (
        "[a-zA-Z0-9]{1,24}",
        "[^\x00]{1,512}",
        arb_sender(),
        proptest::option::of("[a-z0-9]{1,16}"),
        arb_timestamp(),
        proptest::option::of("temp_[a-f0-9]{8}"),
    )
        .prop_map(|(session, content, sender, receiver, timestamp, temp)| {
            OutboundFrame::SendMessage(SendMessageFrame {
                session_id: SessionId::new(session),
                content,
                sender,
                receiver_id: receiver.map(UserId::new),
                timestamp,
                temp_id: temp.map(MessageId::new),
            })
        })
}

proptest! {
    #[test]
    fn decode_inbound_never_panics(text in ".{0,256}") {
        let _ = frame::decode_inbound(&text);
    }

    #[test]
    fn unknown_tags_are_preserved(tag in "[a-z]{1,12}_x", n in any::<i64>()) {
        let text = serde_json::json!({"type": tag, "n": n}).to_string();
        match frame::decode_inbound(&text) {
            Ok(InboundFrame::Other { kind, body }) => {
                prop_assert_eq!(&kind, &tag);
                prop_assert_eq!(body["n"].as_i64(), Some(n));
            }
            other => prop_assert!(false, "expected Other, got {:?}", other),
        }
        let event_type = EventType::from_type_tag(&tag);
        prop_assert_eq!(event_type.as_str(), tag.as_str());
    }

    #[test]
    fn send_message_reaches_server_intact(original in arb_send_message()) {
        let text = frame::encode_outbound(&original).unwrap();
        let decoded = frame::decode_outbound(&text).unwrap();
        prop_assert_eq!(original, decoded);
    }
}
