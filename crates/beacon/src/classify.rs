//! Cheap frame classification ahead of parsing.
//!
//! Only the first `window` bytes of a frame are inspected, and the `type`
//! value must close inside that window. A `"type":"batch_update"` buried in
//! a payload therefore cannot push a frame onto the queued path.

use glowproto::MessageKind;

/// Kind named by the frame's leading `"type": "..."` pair, if any.
pub fn classify(raw: &str, window: usize) -> Option<MessageKind> {
    let bytes = raw.as_bytes();
    let head = &bytes[..bytes.len().min(window)];

    let mut from = 0;
    while let Some(offset) = find(&head[from..], b"\"type\"") {
        let key_end = from + offset + b"\"type\"".len();
        if let Some(kind) = value_after_key(head, key_end) {
            return MessageKind::from_wire(kind);
        }
        from = key_end;
    }
    None
}

/// True when the frame should take the queued path.
pub fn is_high_frequency(raw: &str, window: usize) -> bool {
    classify(raw, window).is_some_and(|kind| kind.is_high_frequency())
}

fn value_after_key(head: &[u8], mut pos: usize) -> Option<&str> {
    pos = skip_whitespace(head, pos);
    if head.get(pos) != Some(&b':') {
        return None;
    }
    pos = skip_whitespace(head, pos + 1);
    if head.get(pos) != Some(&b'"') {
        return None;
    }
    let start = pos + 1;
    let len = head[start..].iter().position(|b| *b == b'"')?;
    std::str::from_utf8(&head[start..start + len]).ok()
}

fn skip_whitespace(head: &[u8], mut pos: usize) -> usize {
    while head.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 60;

    #[test]
    fn leading_type_is_found() {
        assert_eq!(
            classify(r#"{"type":"batch_update","zone":"a","entities":[]}"#, WINDOW),
            Some(MessageKind::BatchUpdate)
        );
        assert_eq!(
            classify(r#"{ "type" : "ping", "timestamp": 1 }"#, WINDOW),
            Some(MessageKind::Ping)
        );
    }

    #[test]
    fn type_outside_window_does_not_count() {
        let padding = "x".repeat(80);
        let raw = format!(r#"{{"zone":"{padding}","type":"batch_update"}}"#);
        assert_eq!(classify(&raw, WINDOW), None);
        assert!(!is_high_frequency(&raw, WINDOW));
    }

    #[test]
    fn value_must_close_inside_window() {
        let raw = format!(r#"{{"pad":"{}","type":"batch_update"}}"#, "y".repeat(30));
        // the opening quote of the value sits inside the window but not the close
        assert!(raw.find("batch_update").unwrap() < WINDOW);
        assert!(raw.find("batch_update").unwrap() + "batch_update".len() >= WINDOW);
        assert_eq!(classify(&raw, WINDOW), None);
    }

    #[test]
    fn type_used_as_a_value_is_skipped() {
        assert_eq!(
            classify(r#"{"effect":"type","type":"audio_state"}"#, WINDOW),
            Some(MessageKind::AudioState)
        );
    }

    #[test]
    fn unknown_or_malformed_is_none() {
        assert_eq!(classify(r#"{"type":"nope"}"#, WINDOW), None);
        assert_eq!(classify("not json at all", WINDOW), None);
        assert_eq!(classify("", WINDOW), None);
    }

    #[test]
    fn multibyte_text_at_window_edge_is_safe() {
        let raw = format!(r#"{{"type":"set_pattern","zone":"{}"}}"#, "é".repeat(40));
        assert_eq!(classify(&raw, WINDOW), Some(MessageKind::SetPattern));
    }
}
