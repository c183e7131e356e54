//! Cell output model.
//!
//! Outputs are opaque typed payloads: the bridge records them in kernel
//! emission order and never interprets rich content beyond picking a
//! plain-text rendering for display.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Mime type -> payload. Ordered so serialization is deterministic.
pub type MimeBundle = BTreeMap<String, Value>;

/// Stream channel of a `stream` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// A single cell output, tagged the way nbformat tags them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Text written to stdout or stderr.
    Stream {
        name: StreamName,
        #[serde(deserialize_with = "multiline")]
        text: String,
    },
    /// The value of the last expression.
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        execution_count: Option<u32>,
    },
    /// Rich display emitted explicitly by the code.
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Kernel-reported failure of the executed code.
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// Create a stream output.
    #[must_use]
    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        Self::Stream {
            name,
            text: text.into(),
        }
    }

    /// Create an error output.
    #[must_use]
    pub fn error(ename: impl Into<String>, evalue: impl Into<String>, traceback: Vec<String>) -> Self {
        Self::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
        }
    }

    /// Whether this output is a stream on the given channel.
    #[must_use]
    pub fn is_stream(&self, channel: StreamName) -> bool {
        matches!(self, Self::Stream { name, .. } if *name == channel)
    }

    /// Whether this output reports an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Human-readable rendering with ANSI escapes removed.
    #[must_use]
    pub fn plain_text(&self) -> String {
        let text = match self {
            Self::Stream { text, .. } => text.clone(),
            Self::ExecuteResult { data, .. } | Self::DisplayData { data, .. } => {
                render_bundle(data)
            }
            Self::Error {
                ename,
                evalue,
                traceback,
            } => {
                if traceback.is_empty() {
                    format!("{ename}: {evalue}")
                } else {
                    format!("{ename}: {evalue}\n{}", traceback.join("\n"))
                }
            }
        };
        strip_ansi(&text)
    }
}

fn render_bundle(data: &MimeBundle) -> String {
    if let Some(text) = data.get("text/plain") {
        return value_text(text);
    }
    if data.contains_key("text/html") {
        return "[HTML output]".to_string();
    }
    if data.contains_key("image/png") {
        return "[Image output (PNG)]".to_string();
    }
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    format!("[{}]", keys.join(", "))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
        other => other.to_string(),
    }
}

/// Decode a base64-encoded binary payload (e.g. `image/png`) from a bundle.
#[must_use]
pub fn decode_binary(data: &MimeBundle, mime: &str) -> Option<Vec<u8>> {
    let encoded = value_text(data.get(mime)?);
    let compact: String = encoded.split_whitespace().collect();
    BASE64.decode(compact).ok()
}

/// Render a whole output list the way an agent wants to read it.
#[must_use]
pub fn render_outputs(outputs: &[Output]) -> String {
    outputs
        .iter()
        .map(Output::plain_text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove ANSI CSI escape sequences (`ESC [ ... letter`).
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// nbformat allows multiline strings to be stored as a list of lines.
pub(crate) fn multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::One(s) => s,
        Multiline::Many(parts) => parts.concat(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        let colored = "\x1b[0;31mValueError\x1b[0m: boom";
        assert_eq!(strip_ansi(colored), "ValueError: boom");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_stream_accepts_line_list() {
        let json = r#"{"output_type":"stream","name":"stdout","text":["a\n","b\n"]}"#;
        let out: Output = serde_json::from_str(json).unwrap();
        assert_eq!(out, Output::stream(StreamName::Stdout, "a\nb\n"));
    }

    #[test]
    fn test_plain_text_placeholders() {
        let mut data = MimeBundle::new();
        data.insert("image/png".into(), Value::String("aGk=".into()));
        let out = Output::DisplayData {
            data: data.clone(),
            metadata: Map::new(),
        };
        assert_eq!(out.plain_text(), "[Image output (PNG)]");
        assert_eq!(decode_binary(&data, "image/png").unwrap(), b"hi");

        data.insert("text/plain".into(), Value::String("<Figure>".into()));
        let out = Output::ExecuteResult {
            data,
            metadata: Map::new(),
            execution_count: Some(3),
        };
        assert_eq!(out.plain_text(), "<Figure>");
    }

    #[test]
    fn test_error_rendering() {
        let out = Output::error("ValueError", "boom", vec!["\x1b[1mline 1\x1b[0m".into()]);
        assert!(out.is_error());
        assert_eq!(out.plain_text(), "ValueError: boom\nline 1");
    }
}
