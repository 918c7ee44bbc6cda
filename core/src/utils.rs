//! Utility functions and helpers

use crate::message::{ParsedEvent, TagValue};
use lazy_static::lazy_static;
use regex::Regex;

/// Leading character of a channel name
pub const CHANNEL_SIGIL: char = '#';

lazy_static! {
    static ref BADGE_VERSION: Regex = Regex::new(r"/\d+").expect("valid badge regex");
}

/// Ensure a channel name carries its sigil
pub fn normalize_channel(channel: &str) -> String {
    if channel.starts_with(CHANNEL_SIGIL) {
        channel.to_string()
    } else {
        format!("{}{}", CHANNEL_SIGIL, channel)
    }
}

/// Status symbol for a chat badge
fn badge_symbol(badge: &str) -> Option<char> {
    match badge {
        "broadcaster" => Some('~'),
        "admin" => Some('!'),
        "global_mod" => Some('*'),
        "moderator" => Some('@'),
        "subscriber" => Some('%'),
        "staff" => Some('&'),
        "turbo" => Some('+'),
        _ => None,
    }
}

/// Status symbols for a `badges` tag such as `moderator/1,subscriber/12`
pub fn badge_symbols(badges: Option<&TagValue>) -> String {
    let Some(TagValue::Value(badges)) = badges else {
        return String::new();
    };

    BADGE_VERSION
        .replace_all(badges, "")
        .split(',')
        .filter_map(badge_symbol)
        .collect()
}

/// Operator-facing rendering of a chat line: `[#room] <@Alice> text`
pub fn format_chat_line(event: &ParsedEvent) -> String {
    format!(
        "[{}] <{}{}> {}",
        event.target.as_deref().unwrap_or("*"),
        badge_symbols(event.tags.get("badges")),
        event.display_name().unwrap_or("unknown"),
        event.message.as_deref().unwrap_or(""),
    )
}
