use std::collections::HashSet;

use chrono::{DateTime, Local};
use crossterm::style::Stylize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const BANNER_WIDTH: usize = 64;

/// MIME types the terminal side treats as images.
static IMAGE_TYPES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["image/jpeg", "image/png", "image/gif"]));

static LINK_WITH_LABEL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<((?:https?|mailto):[^>|]+)\|([^>]+)>").expect("valid labeled link regex")
});
static RAW_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<((?:https?|mailto):[^>]+)>").expect("valid raw link regex"));
static USER_MENTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@([A-Z0-9]+)(?:\|[^>]+)?>").expect("valid user mention regex"));
static CHANNEL_MENTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<#([A-Z0-9]+)\|([^>]+)>").expect("valid channel mention regex")
});

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("event is missing required field `{field}`: {payload}")]
    MissingField {
        field: &'static str,
        /// Offending payload, surfaced with the error for diagnosis.
        payload: Value,
    },
}

/// A message event from the events API or a history page. Fields beyond the
/// ones modelled here are ignored on deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Decimal timestamp string, unique per channel, usable as a cursor.
    pub ts: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl MessageEvent {
    pub fn is_direct_message(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub elements: Vec<BlockElement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockElement {
    #[serde(default)]
    pub elements: Vec<Inline>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Inline {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "link")]
    Link {
        url: String,
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "emoji")]
    Emoji {
        name: String,
        /// Hyphen-separated hex code points, e.g. `"1f468-200d-1f4bb"`.
        #[serde(default)]
        unicode: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Attachment descriptor on a message event.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub permalink_public: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
}

impl FileRef {
    /// The remote copy was deleted; only cached bytes remain retrievable.
    pub fn is_tombstone(&self) -> bool {
        self.mode.as_deref() == Some("tombstone")
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn permalink(&self) -> Option<&str> {
        self.permalink_public
            .as_deref()
            .or(self.permalink.as_deref())
    }
}

/// What the display worker should do with one attachment.
#[derive(Debug, Clone)]
pub enum Attachment {
    /// Externally hosted; show the permalink instead of fetching bytes.
    External { name: String, permalink: String },
    /// Hosted by Slack; fetch through the file cache.
    Stored { file: FileRef, image: bool },
}

#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Pure transform from a message event to its display body and attachment
/// descriptors. Events whose type is not `message` render to nothing.
pub fn render(event: &MessageEvent) -> Rendered {
    if event.kind != "message" {
        return Rendered::default();
    }

    let body = if event.blocks.is_empty() {
        normalize_slack_text(event.text.as_deref().unwrap_or_default())
    } else {
        render_blocks(&event.blocks)
    };

    let attachments = event.files.iter().map(classify_attachment).collect();

    Rendered { body, attachments }
}

/// Walk the block tree in document order. Slack's block order is the
/// authoritative text layout, so concatenation must follow it exactly.
fn render_blocks(blocks: &[Block]) -> String {
    let mut parts = Vec::new();
    for block in blocks {
        for element in &block.elements {
            for inline in &element.elements {
                match inline {
                    Inline::Text { text } => parts.push(sanitize_text(text)),
                    Inline::Link { url, text } => {
                        let label = text.as_deref().unwrap_or(url);
                        parts.push(format!(
                            "{} ({})",
                            sanitize_text(label),
                            sanitize_text(url)
                        ));
                    }
                    Inline::Emoji { name, unicode } => {
                        let rendered = unicode
                            .as_deref()
                            .and_then(decode_emoji)
                            .unwrap_or_else(|| format!(":{name}:"));
                        parts.push(rendered);
                    }
                    Inline::Other => {}
                }
            }
        }
    }
    parts.concat()
}

fn classify_attachment(file: &FileRef) -> Attachment {
    if file.is_external {
        Attachment::External {
            name: file.display_name().to_string(),
            permalink: file.permalink().unwrap_or_default().to_string(),
        }
    } else {
        let image = file
            .mimetype
            .as_deref()
            .is_some_and(|mimetype| IMAGE_TYPES.contains(mimetype));
        Attachment::Stored {
            file: file.clone(),
            image,
        }
    }
}

/// Decode a hyphen-separated hex code-point sequence into the literal
/// Unicode string, e.g. `"1f600"` → 😀. Malformed input yields `None`.
fn decode_emoji(unicode: &str) -> Option<String> {
    unicode
        .split('-')
        .map(|code| u32::from_str_radix(code, 16).ok().and_then(char::from_u32))
        .collect()
}

/// Strip control characters so event text cannot inject terminal escapes.
fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Fallback formatting for messages that carry no block tree: undo Slack's
/// wire escaping and unwrap its `<...>` link and mention syntax.
fn normalize_slack_text(input: &str) -> String {
    let mut text = input
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");

    text = LINK_WITH_LABEL_REGEX
        .replace_all(&text, |caps: &regex::Captures| {
            format!("{} ({})", &caps[2], &caps[1])
        })
        .to_string();
    text = RAW_LINK_REGEX
        .replace_all(&text, |caps: &regex::Captures| caps[1].to_string())
        .to_string();
    text = USER_MENTION_REGEX
        .replace_all(&text, |caps: &regex::Captures| format!("@{}", &caps[1]))
        .to_string();
    text = CHANNEL_MENTION_REGEX
        .replace_all(&text, |caps: &regex::Captures| format!("#{}", &caps[2]))
        .to_string();
    text = text
        .replace("<!channel>", "@channel")
        .replace("<!here>", "@here")
        .replace("<!everyone>", "@everyone");

    sanitize_text(&text)
}

/// `[user] [timestamp]` and optionally `[thread-ts]` prefix for one message.
pub fn format_header(user_name: &str, ts: &str, show_thread_ts: bool) -> String {
    let user_part = format!("[{}]", sanitize_text(user_name)).green().bold();
    let ts_part = format!("[{}]", format_ts(ts)).dark_magenta();
    let mut header = format!("{user_part} {ts_part}");
    if show_thread_ts {
        let thread_part = format!("[{}]", sanitize_text(ts)).italic();
        header.push(' ');
        header.push_str(&thread_part.to_string());
    }
    header
}

/// Conversation banner: a full-width rule carrying the conversation name.
pub fn banner_line(name: &str) -> String {
    let label = format!(" {} ", sanitize_text(name));
    format!("{label:─^width$}", width = BANNER_WIDTH)
        .magenta()
        .bold()
        .to_string()
}

pub fn external_attachment_line(name: &str, permalink: &str) -> String {
    format!("{} ({})", sanitize_text(name), sanitize_text(permalink))
        .blue()
        .bold()
        .to_string()
}

pub fn stored_attachment_line(file: &FileRef, image: bool) -> String {
    let name = sanitize_text(file.display_name());
    let line = if image {
        name
    } else {
        format!("{name} (file ID: {})", file.id)
    };
    line.underlined().to_string()
}

/// Decode a Slack decimal timestamp into local wall-clock time.
pub fn format_ts(ts: &str) -> String {
    let parsed = ts
        .parse::<f64>()
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds as i64, 0));
    match parsed {
        Some(datetime) => datetime
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => ts.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn event_from(value: Value) -> MessageEvent {
        serde_json::from_value(value).expect("valid message event")
    }

    #[test]
    fn renders_blocks_in_document_order() {
        let event = event_from(json!({
            "type": "message",
            "channel": "C100",
            "user": "U100",
            "ts": "1700000000.000100",
            "blocks": [{
                "type": "rich_text",
                "elements": [{
                    "type": "rich_text_section",
                    "elements": [
                        { "type": "text", "text": "a" },
                        { "type": "emoji", "name": "grinning", "unicode": "1f600" },
                        { "type": "link", "url": "http://x", "text": "y" }
                    ]
                }]
            }]
        }));
        let rendered = render(&event);
        assert_eq!(rendered.body, "a\u{1f600}y (http://x)");
        assert!(rendered.attachments.is_empty());

        // Pure: a second pass yields identical output.
        assert_eq!(render(&event).body, rendered.body);
    }

    #[test]
    fn non_message_event_renders_to_nothing() {
        let event = event_from(json!({
            "type": "channel_topic",
            "channel": "C100",
            "ts": "1700000000.000100",
            "files": [{ "id": "F1", "name": "ignored.png" }]
        }));
        let rendered = render(&event);
        assert!(rendered.body.is_empty());
        assert!(rendered.attachments.is_empty());
    }

    #[test]
    fn link_without_label_falls_back_to_url() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "blocks": [{
                "elements": [{
                    "elements": [{ "type": "link", "url": "https://example.org" }]
                }]
            }]
        }));
        assert_eq!(
            render(&event).body,
            "https://example.org (https://example.org)"
        );
    }

    #[test]
    fn unknown_inline_elements_are_skipped() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "blocks": [{
                "elements": [{
                    "elements": [
                        { "type": "text", "text": "before" },
                        { "type": "usergroup", "usergroup_id": "S1" },
                        { "type": "text", "text": "after" }
                    ]
                }]
            }]
        }));
        assert_eq!(render(&event).body, "beforeafter");
    }

    #[test_case("1f600", Some("\u{1f600}"); "single code point")]
    #[test_case("1f468-200d-1f4bb", Some("\u{1f468}\u{200d}\u{1f4bb}"); "joined sequence")]
    #[test_case("not-hex", None; "malformed hex")]
    #[test_case("110000", None; "out of range scalar")]
    fn decodes_emoji_sequences(input: &str, expected: Option<&str>) {
        assert_eq!(decode_emoji(input).as_deref(), expected);
    }

    #[test]
    fn emoji_without_unicode_falls_back_to_name() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "blocks": [{
                "elements": [{
                    "elements": [{ "type": "emoji", "name": "partyparrot" }]
                }]
            }]
        }));
        assert_eq!(render(&event).body, ":partyparrot:");
    }

    #[test]
    fn text_without_blocks_is_normalized() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "text": "see <https://example.org|the docs> &amp; ping <@U42>"
        }));
        assert_eq!(
            render(&event).body,
            "see the docs (https://example.org) & ping @U42"
        );
    }

    #[test]
    fn control_characters_are_stripped() {
        assert_eq!(sanitize_text("a\u{1b}[31mred\u{7}"), "a[31mred");
        assert_eq!(sanitize_text("line\nbreak\ttab"), "line\nbreak\ttab");
    }

    #[test]
    fn external_files_classify_as_permalinks() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "files": [{
                "id": "F1",
                "name": "report.pdf",
                "is_external": true,
                "permalink_public": "https://example.org/report"
            }]
        }));
        let rendered = render(&event);
        match &rendered.attachments[..] {
            [Attachment::External { name, permalink }] => {
                assert_eq!(name, "report.pdf");
                assert_eq!(permalink, "https://example.org/report");
            }
            other => panic!("unexpected attachments: {other:?}"),
        }
    }

    #[test]
    fn stored_files_carry_tombstone_and_image_flags() {
        let event = event_from(json!({
            "type": "message",
            "user": "U100",
            "ts": "1700000000.000100",
            "files": [
                { "id": "F1", "name": "photo.png", "mimetype": "image/png" },
                { "id": "F2", "name": "gone.txt", "mimetype": "text/plain", "mode": "tombstone" }
            ]
        }));
        let rendered = render(&event);
        match &rendered.attachments[..] {
            [
                Attachment::Stored { file: first, image: true },
                Attachment::Stored { file: second, image: false },
            ] => {
                assert!(!first.is_tombstone());
                assert!(second.is_tombstone());
            }
            other => panic!("unexpected attachments: {other:?}"),
        }
    }

    #[test]
    fn format_ts_falls_back_to_raw_string() {
        assert_eq!(format_ts("not-a-number"), "not-a-number");
    }

    #[test]
    fn banner_line_contains_the_name() {
        let banner = banner_line("general");
        assert!(banner.contains("general"));
    }
}
