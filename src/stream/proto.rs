//! Push-channel frame codec and event-code taxonomy.
//!
//! The vendor channel speaks socket.io over a websocket (engine.io v3 text
//! frames). Only the handful of frame kinds the SDK reacts to are modeled;
//! everything else is ignored. Event payloads carry a numeric `eventCid`
//! that maps onto a closed set of semantic alarm-event tags.

use serde_json::Value;

/// Semantic tag for a push event, derived from the vendor event code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlarmEvent {
    Off,
    HomeCount,
    Home,
    AwayCount,
    Away,
    Entry,
    Motion,
}

/// How a vendor event code should be handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventDisposition {
    /// Deliver the payload with this semantic tag.
    Tagged(AlarmEvent),
    /// Deliver the payload with no tag.
    Untagged,
    /// Automatic self-test; no delivery at all.
    Suppressed,
}

/// Maps a vendor event code onto its disposition.
///
/// The mapping is a closed enumeration: 1400/1407 come from the master PIN
/// and remote respectively, 9401/9407 and 3401/3407 from keypad and remote.
pub fn classify_event_code(code: i64) -> EventDisposition {
    match code {
        1400 | 1407 => EventDisposition::Tagged(AlarmEvent::Off),
        9441 => EventDisposition::Tagged(AlarmEvent::HomeCount),
        3441 => EventDisposition::Tagged(AlarmEvent::Home),
        9401 | 9407 => EventDisposition::Tagged(AlarmEvent::AwayCount),
        3401 | 3407 => EventDisposition::Tagged(AlarmEvent::Away),
        1429 => EventDisposition::Tagged(AlarmEvent::Entry),
        1170 => EventDisposition::Tagged(AlarmEvent::Motion),
        1602 => EventDisposition::Suppressed,
        _ => EventDisposition::Untagged,
    }
}

pub(crate) const PING_FRAME: &str = "2";
pub(crate) const PONG_FRAME: &str = "3";

/// Builds the namespace connect frame sent after the engine.io open.
pub(crate) fn connect_frame(namespace: &str) -> String {
    format!("40{namespace}")
}

/// Inbound frames the channel worker distinguishes.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Open,
    Ping,
    Pong,
    NamespaceAck,
    Disconnect,
    Event(Value),
    Ignored,
}

/// Parses one inbound text frame.
///
/// Event frames addressed to a different namespace are ignored.
pub(crate) fn parse_frame(text: &str, namespace: &str) -> Frame {
    match text.as_bytes().first() {
        Some(b'0') => Frame::Open,
        Some(b'2') => Frame::Ping,
        Some(b'3') => Frame::Pong,
        Some(b'4') => parse_message_frame(&text[1..], namespace),
        _ => Frame::Ignored,
    }
}

fn parse_message_frame(rest: &str, namespace: &str) -> Frame {
    match rest.as_bytes().first() {
        Some(b'0') => Frame::NamespaceAck,
        Some(b'1') => Frame::Disconnect,
        Some(b'2') => parse_event_frame(&rest[1..], namespace),
        _ => Frame::Ignored,
    }
}

fn parse_event_frame(rest: &str, namespace: &str) -> Frame {
    // An optional "/ns," prefix sits ahead of the JSON argument array.
    let payload = if let Some(tail) = rest.strip_prefix('/') {
        let Some((ns, json)) = tail.split_once(',') else {
            return Frame::Ignored;
        };
        if format!("/{ns}") != namespace {
            return Frame::Ignored;
        }
        json
    } else {
        rest
    };

    let Ok(Value::Array(args)) = serde_json::from_str(payload) else {
        return Frame::Ignored;
    };
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(Value::String(name)), Some(payload)) if name == "event" => Frame::Event(payload),
        _ => Frame::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        classify_event_code, connect_frame, parse_frame, AlarmEvent, EventDisposition, Frame,
    };

    const NS: &str = "/v1/user/42";

    #[test]
    fn arming_codes_map_to_their_tags() {
        for (code, tag) in [
            (1400, AlarmEvent::Off),
            (1407, AlarmEvent::Off),
            (9441, AlarmEvent::HomeCount),
            (3441, AlarmEvent::Home),
            (9401, AlarmEvent::AwayCount),
            (9407, AlarmEvent::AwayCount),
            (3401, AlarmEvent::Away),
            (3407, AlarmEvent::Away),
            (1429, AlarmEvent::Entry),
            (1170, AlarmEvent::Motion),
        ] {
            assert_eq!(
                classify_event_code(code),
                EventDisposition::Tagged(tag),
                "code {code}"
            );
        }
    }

    #[test]
    fn self_test_code_is_suppressed() {
        assert_eq!(classify_event_code(1602), EventDisposition::Suppressed);
    }

    #[test]
    fn unknown_codes_are_delivered_untagged() {
        assert_eq!(classify_event_code(99999), EventDisposition::Untagged);
        assert_eq!(classify_event_code(0), EventDisposition::Untagged);
        assert_eq!(classify_event_code(-1), EventDisposition::Untagged);
    }

    #[test]
    fn open_ping_pong_frames_parse() {
        assert_eq!(
            parse_frame(r#"0{"pingInterval":25000}"#, NS),
            Frame::Open
        );
        assert_eq!(parse_frame("2", NS), Frame::Ping);
        assert_eq!(parse_frame("3", NS), Frame::Pong);
    }

    #[test]
    fn namespace_ack_and_disconnect_frames_parse() {
        assert_eq!(parse_frame("40/v1/user/42", NS), Frame::NamespaceAck);
        assert_eq!(parse_frame("41/v1/user/42", NS), Frame::Disconnect);
    }

    #[test]
    fn event_frame_with_namespace_prefix_yields_payload() {
        let frame = parse_frame(r#"42/v1/user/42,["event",{"eventCid":3401}]"#, NS);
        assert_eq!(frame, Frame::Event(json!({"eventCid": 3401})));
    }

    #[test]
    fn event_frame_without_namespace_prefix_yields_payload() {
        let frame = parse_frame(r#"42["event",{"eventCid":1170}]"#, NS);
        assert_eq!(frame, Frame::Event(json!({"eventCid": 1170})));
    }

    #[test]
    fn event_frame_for_other_namespace_is_ignored() {
        let frame = parse_frame(r#"42/v1/user/7,["event",{"eventCid":3401}]"#, NS);
        assert_eq!(frame, Frame::Ignored);
    }

    #[test]
    fn non_event_messages_and_garbage_are_ignored() {
        assert_eq!(parse_frame(r#"42["hello",{}]"#, NS), Frame::Ignored);
        assert_eq!(parse_frame("42not-json", NS), Frame::Ignored);
        assert_eq!(parse_frame("", NS), Frame::Ignored);
        assert_eq!(parse_frame("9", NS), Frame::Ignored);
    }

    #[test]
    fn connect_frame_targets_the_namespace() {
        assert_eq!(connect_frame(NS), "40/v1/user/42");
    }
}
