//! Chat wire protocol parsing and formatting
//!
//! Lines follow the IRC grammar with IRCv3 message tags:
//! `[@tag1=val1;tag2 ][:prefix ]COMMAND param1 param2 :trailing with spaces\r\n`.
//!
//! Framing lives in [`LineCodec`], which splits a byte buffer into complete
//! lines. It holds no state of its own; the carry-over bytes stay in the
//! caller's buffer between reads.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::codec::Decoder;

/// Line delimiter used on the wire
pub const LINE_DELIMITER: &[u8; 2] = b"\r\n";

/// Value of a single message tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagValue {
    /// Tag present without a value (`@flag` or `@flag=`)
    Flag,
    /// Tag with an unescaped string value
    Value(String),
}

impl TagValue {
    /// String value of the tag, if it carries one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Flag => None,
            TagValue::Value(value) => Some(value),
        }
    }
}

/// Message tags keyed by tag name
pub type Tags = BTreeMap<String, TagValue>;

/// A single chat protocol line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// IRCv3 message tags
    pub tags: Tags,
    /// Sender identity (`nick!user@host` or server name)
    pub prefix: Option<String>,
    /// Command token as it appeared on the wire
    pub command: String,
    /// Parameters; the trailing parameter may contain spaces
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message without tags or prefix
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            tags: Tags::new(),
            prefix: None,
            command: command.to_string(),
            params,
        }
    }

    /// Attach a tag with a value
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), TagValue::Value(value.to_string()));
        self
    }

    /// Parse a single line.
    ///
    /// Returns `None` when the line has no command token; such lines are
    /// dropped by callers rather than treated as errors.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_str, remainder) = tagged.split_once(' ')?;
            rest = remainder.trim_start_matches(' ');
            parse_tags(tag_str)
        } else {
            Tags::new()
        };

        let prefix = if let Some(prefixed) = rest.strip_prefix(':') {
            let (prefix, remainder) = prefixed.split_once(' ')?;
            rest = remainder.trim_start_matches(' ');
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, remainder)) => (command, remainder),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, remainder)) => {
                    params.push(param.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_string(),
            params,
        })
    }

    /// Nickname portion of the prefix
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        let nick = prefix.split('@').next()?.split('!').next()?;
        Some(nick)
    }

    /// Check the command token, ignoring case
    pub fn is_command(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                match value {
                    TagValue::Flag => write!(f, "{}", key)?,
                    TagValue::Value(value) => write!(f, "{}={}", key, escape_tag_value(value))?,
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{} ", prefix)?;
        }

        write!(f, "{}", self.command)?;

        for (i, param) in self.params.iter().enumerate() {
            let last = i == self.params.len() - 1;
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

/// Parse a tag block without the leading `@`
fn parse_tags(tag_str: &str) -> Tags {
    let mut tags = Tags::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((key, "")) => (key, TagValue::Flag),
            Some((key, value)) => (key, TagValue::Value(unescape_tag_value(value))),
            None => (pair, TagValue::Flag),
        };
        tags.insert(key.to_string(), value);
    }
    tags
}

fn unescape_tag_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => result.push(';'),
            Some('s') => result.push(' '),
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

fn escape_tag_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            other => result.push(other),
        }
    }
    result
}

/// A parsed inbound line, ready for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    /// Lower-cased command name (e.g. `privmsg`)
    pub command: String,
    /// First parameter, usually a channel
    pub target: Option<String>,
    /// Sender nickname from the prefix
    pub nick: Option<String>,
    /// Message tags, empty when the line had none
    pub tags: Tags,
    /// Second parameter, the message text for chat lines
    pub message: Option<String>,
    /// The raw line as received
    pub raw: String,
}

impl ParsedEvent {
    /// Build an event from a parsed message and the line it came from
    pub fn from_message(message: Message, raw: &str) -> Self {
        let nick = message.nick().map(str::to_string);
        let mut params = message.params.into_iter();
        Self {
            command: message.command.to_ascii_lowercase(),
            target: params.next(),
            nick,
            tags: message.tags,
            message: params.next(),
            raw: raw.to_string(),
        }
    }

    /// String value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(TagValue::as_str)
    }

    /// Display name tag if present, otherwise the nickname
    pub fn display_name(&self) -> Option<&str> {
        self.tag("display-name").or(self.nick.as_deref())
    }
}

/// Stateless `\r\n` line framer
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCodec;

impl LineCodec {
    /// Append a chunk to the carry-over buffer and take every complete line
    pub fn feed(&mut self, buffer: &mut BytesMut, chunk: &[u8]) -> Vec<String> {
        buffer.extend_from_slice(chunk);
        self.drain_lines(buffer)
    }

    /// Take every complete line from the buffer, leaving any partial line behind
    pub fn drain_lines(&mut self, buffer: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = self.decode(buffer) {
            lines.push(line);
        }
        lines
    }

    /// Format a message as a framed wire line
    pub fn frame(message: &Message) -> String {
        format!("{}\r\n", message)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<String>> {
        let Some(pos) = src.windows(LINE_DELIMITER.len()).position(|w| w == LINE_DELIMITER) else {
            return Ok(None);
        };
        let line = src.split_to(pos + LINE_DELIMITER.len());
        Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()))
    }
}
