//! Conversions between MQTT topics and `(channel, subtopic)` pairs.
//!
//! Publish topics look like `channels/<channel>/messages[/<seg>...][/ct/<type>/<subtype>]`.
//! Subtopic segments are URL-decoded once and joined with `.`, empty segments
//! are dropped.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

pub const CONTENT_TYPE_TAIL: &str = "/ct/";

static CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/?channels/([\w\-]+)/messages(/[^?]*)?(\?.*)?$").unwrap());

static MEDIA_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(application|audio|font|image|message|model|multipart|text|video)/[\w.+\-]+$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("malformed topic")]
    MalformedTopic,
    #[error("malformed subtopic")]
    MalformedSubtopic,
}

/// A publish topic split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTopic {
    pub channel: String,
    pub subtopic: String,
    pub content_type: Option<String>,
}

/// Parses `channels/<chan>/messages[/<path>][/ct/<content-type>][?query]`.
///
/// Publish subtopics must not carry wildcards of any length.
pub fn parse_publish_topic(topic: &str) -> Result<PublishTopic, TopicError> {
    let caps = CHANNEL_RE.captures(topic).ok_or(TopicError::MalformedTopic)?;
    let channel = caps.get(1).map(|m| m.as_str()).ok_or(TopicError::MalformedTopic)?.to_owned();
    let path = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let (path, content_type) = match split_content_type(path) {
        Some((path, ct)) => (path, Some(ct)),
        None => (path, None),
    };

    let subtopic = parse_subtopic(path)?;
    if subtopic.split('.').any(|s| s == "*" || s == ">") {
        return Err(TopicError::MalformedSubtopic);
    }
    Ok(PublishTopic { channel, subtopic, content_type })
}

/// Splits off a trailing `/ct/<type>/<subtype>`, the media type may be escaped
/// into one segment. Any other `ct` segment stays part of the subtopic.
fn split_content_type(path: &str) -> Option<(&str, String)> {
    let idx = path.rfind(CONTENT_TYPE_TAIL)?;
    let ct = unescape(&path[idx + CONTENT_TYPE_TAIL.len()..]).ok()?;
    MEDIA_TYPE_RE.is_match(&ct).then(|| (&path[..idx], ct))
}

/// Parses a subscribe topic filter, `+` becomes `*` and `#` becomes `>`.
pub fn parse_subscribe_topic(topic: &str) -> Result<(String, String), TopicError> {
    let caps = CHANNEL_RE.captures(topic).ok_or(TopicError::MalformedTopic)?;
    let channel = caps.get(1).map(|m| m.as_str()).ok_or(TopicError::MalformedTopic)?.to_owned();
    let path = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let mut segs = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" => continue,
            "+" => segs.push("*"),
            "#" => segs.push(">"),
            s if s.contains(['+', '#']) => return Err(TopicError::MalformedSubtopic),
            s => segs.push(s),
        }
    }
    let subtopic = parse_subtopic(&segs.join("/"))?;
    Ok((channel, subtopic))
}

/// URL-decodes once, maps `/` to `.`, drops empty segments and rejects
/// segments longer than one character that contain `*` or `>`.
pub fn parse_subtopic(path: &str) -> Result<String, TopicError> {
    if path.is_empty() {
        return Ok(String::new());
    }
    let decoded = unescape(path)?.replace('/', ".");
    let mut elems = Vec::new();
    for elem in decoded.split('.') {
        if elem.is_empty() {
            continue;
        }
        if elem.len() > 1 && (elem.contains('*') || elem.contains('>')) {
            return Err(TopicError::MalformedSubtopic);
        }
        elems.push(elem);
    }
    Ok(elems.join("."))
}

/// Inverse of [`parse_publish_topic`] for the forwarder.
pub fn build_mqtt_topic(channel: &str, subtopic: &str) -> String {
    let mut topic = format!("channels/{channel}/messages");
    for seg in subtopic.split('.').filter(|s| !s.is_empty()) {
        topic.push('/');
        topic.push_str(seg);
    }
    topic
}

fn unescape(s: &str) -> Result<String, TopicError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2 && bytes[i + 1].is_ascii_hexdigit() && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(TopicError::MalformedSubtopic);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| TopicError::MalformedSubtopic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_topics() {
        let t = parse_publish_topic("channels/ch-1/messages/engine/temperature").unwrap();
        assert_eq!(t.channel, "ch-1");
        assert_eq!(t.subtopic, "engine.temperature");
        assert_eq!(t.content_type, None);

        let t = parse_publish_topic("/channels/ch-1/messages").unwrap();
        assert_eq!(t.subtopic, "");

        let t = parse_publish_topic("channels/ch-1/messages/a//b/?x=1").unwrap();
        assert_eq!(t.subtopic, "a.b");

        let t = parse_publish_topic("channels/ch-1/messages/a%2Fb/c%20d").unwrap();
        assert_eq!(t.subtopic, "a.b.c d");

        let t = parse_publish_topic("channels/ch-1/messages////").unwrap();
        assert_eq!(t.subtopic, "");
    }

    #[test]
    fn content_type_tail() {
        let t = parse_publish_topic("channels/ch-1/messages/room/ct/application%2Fsenml%2Bcbor").unwrap();
        assert_eq!(t.subtopic, "room");
        assert_eq!(t.content_type.as_deref(), Some("application/senml+cbor"));

        let t = parse_publish_topic("channels/ch-1/messages/ct/application/senml+json").unwrap();
        assert_eq!(t.subtopic, "");
        assert_eq!(t.content_type.as_deref(), Some("application/senml+json"));
    }

    #[test]
    fn ct_segment_without_media_type_is_subtopic() {
        let t = parse_publish_topic("channels/ch-1/messages/a/ct/b/c").unwrap();
        assert_eq!(t.subtopic, "a.ct.b.c");
        assert_eq!(t.content_type, None);

        let t = parse_publish_topic("channels/ch-1/messages/a/ct/text/plain/extra").unwrap();
        assert_eq!(t.subtopic, "a.ct.text.plain.extra");
        assert_eq!(t.content_type, None);

        let t = parse_publish_topic("channels/ch-1/messages/ct/").unwrap();
        assert_eq!(t.subtopic, "ct");

        let t = parse_publish_topic("channels/ch-1/messages/ct/x/ct/text/plain").unwrap();
        assert_eq!(t.subtopic, "ct.x");
        assert_eq!(t.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn malformed() {
        assert_eq!(parse_publish_topic("invalid/topic"), Err(TopicError::MalformedTopic));
        assert_eq!(parse_publish_topic("channels//messages"), Err(TopicError::MalformedTopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messagesx"), Err(TopicError::MalformedTopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/foo/bar>"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/a*"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/*"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/%zz"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/a%2"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_publish_topic("channels/ch-1/messages/%ff"), Err(TopicError::MalformedSubtopic));
    }

    #[test]
    fn subtopic_rules() {
        assert_eq!(parse_subtopic(""), Ok("".into()));
        assert_eq!(parse_subtopic("/a/b"), Ok("a.b".into()));
        assert_eq!(parse_subtopic("/a.b/c"), Ok("a.b.c".into()));
        assert_eq!(parse_subtopic("/a/*"), Ok("a.*".into()));
        assert_eq!(parse_subtopic("/a/>"), Ok("a.>".into()));
        assert_eq!(parse_subtopic("/a/b*"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_subtopic("/a/%2A%2A"), Err(TopicError::MalformedSubtopic));
    }

    #[test]
    fn subscribe_wildcards() {
        assert_eq!(parse_subscribe_topic("channels/ch-1/messages/#"), Ok(("ch-1".into(), ">".into())));
        assert_eq!(parse_subscribe_topic("channels/ch-1/messages/+/temp"), Ok(("ch-1".into(), "*.temp".into())));
        assert_eq!(parse_subscribe_topic("channels/ch-1/messages"), Ok(("ch-1".into(), "".into())));
        assert_eq!(parse_subscribe_topic("channels/ch-1/messages/a+"), Err(TopicError::MalformedSubtopic));
        assert_eq!(parse_subscribe_topic("channels/+/messages"), Err(TopicError::MalformedTopic));
    }

    #[test]
    fn build_then_parse_is_identity() {
        let cases = [
            ("ch-1", ""),
            ("ch-1", "a"),
            ("5c2a0a4d-2d27-4ab5-9bd2-29ef7a1b5d7c", "engine.temperature.left"),
            ("x_y", "a b.c%d.e-f"),
        ];
        for (channel, subtopic) in cases {
            let topic = build_mqtt_topic(channel, subtopic);
            // `%` must be escaped on the way back in
            let topic = topic.replace('%', "%25");
            let parsed = parse_publish_topic(&topic).unwrap();
            assert_eq!(parsed.channel, channel);
            assert_eq!(parsed.subtopic, subtopic);
        }
        assert_eq!(build_mqtt_topic("ch", "a.b"), "channels/ch/messages/a/b");
    }
}
