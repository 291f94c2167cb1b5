//! Message normalization
//!
//! Turns raw RFC 5322 bytes into a [`NormalizedMessage`]: a fixed record
//! of lower-cased fields used by rule predicates, plus a raw header map for
//! anything the record does not model.

use crate::mailbox::RawMessage;
use crate::rules::predicate::{FieldSource, FieldValue};
use mail_parser::{Address, Message, MessageParser, MimeHeaders, PartType};
use mailjudge_common::types::Uid;
use std::collections::BTreeMap;
use thiserror::Error;

/// Normalization failure for one message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("message {uid} could not be parsed")]
    Unparsable { uid: Uid },

    #[error("message {uid} is empty")]
    Empty { uid: Uid },
}

impl From<NormalizeError> for mailjudge_common::Error {
    fn from(e: NormalizeError) -> Self {
        mailjudge_common::Error::Other(anyhow::Error::new(e))
    }
}

/// Comparable view of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub uid: Uid,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub delivered_to: String,
    pub reply_to: String,
    pub subject: String,
    pub message_id: String,
    pub user_agent: String,
    /// First non-attachment `text/plain` part, or the only part of a
    /// single-part message
    pub body: String,
    pub is_spam: bool,
    /// Sanitized header name -> unfolded, lower-cased value
    pub headers: BTreeMap<String, String>,
}

impl NormalizedMessage {
    /// Look up a raw header by its wire name (`X-Mailer`) or sanitized name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&sanitize_header(name)).map(String::as_str)
    }
}

impl FieldSource for NormalizedMessage {
    fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        let text = match name {
            "from" | "addr_from" => &self.from,
            "to" | "addr_to" => &self.to,
            "cc" | "addr_cc" => &self.cc,
            "delivered_to" => &self.delivered_to,
            "reply_to" => &self.reply_to,
            "subject" => &self.subject,
            "message_id" | "msgid" => &self.message_id,
            "user_agent" | "ua" => &self.user_agent,
            "body" | "message" => &self.body,
            "is_spam" => return Some(FieldValue::Flag(self.is_spam)),
            other => return self.headers.get(other).map(|v| FieldValue::Text(v)),
        };
        Some(FieldValue::Text(text))
    }

    fn header(&self, name: &str) -> Option<&str> {
        NormalizedMessage::header(self, name)
    }
}

/// Parses raw messages into [`NormalizedMessage`]s
#[derive(Debug, Default, Clone)]
pub struct MessageNormalizer;

impl MessageNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, raw: &RawMessage) -> Result<NormalizedMessage, NormalizeError> {
        if raw.bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(NormalizeError::Empty { uid: raw.uid });
        }

        let message = MessageParser::default()
            .parse(&raw.bytes)
            .ok_or(NormalizeError::Unparsable { uid: raw.uid })?;

        let fields = unfold_headers(&decode_bytes(header_section(&raw.bytes)));
        let headers = parse_headers(&fields);
        let raw_header = |name: &str| headers.get(name).cloned().unwrap_or_default();

        let body = message_body(&message).map(normalize_text).unwrap_or_default();

        let delivered_to = fields
            .iter()
            .find(|(name, _)| sanitize_header(name) == "delivered_to")
            .map(|(_, value)| parse_address_value(value))
            .unwrap_or_default();

        Ok(NormalizedMessage {
            uid: raw.uid,
            from: format_addresses(message.from()),
            to: format_addresses(message.to()),
            cc: format_addresses(message.cc()),
            delivered_to,
            reply_to: format_addresses(message.reply_to()),
            subject: message.subject().map(normalize_text).unwrap_or_default(),
            message_id: raw_header("message_id"),
            user_agent: raw_header("user_agent"),
            body,
            is_spam: is_spam(&headers),
            headers,
        })
    }
}

/// Body text used for matching.
///
/// Multipart messages use their first non-attachment `text/plain` part.
/// A single-part message uses its only body whatever its text subtype, so
/// an HTML-only newsletter is still matched on its markup.
fn message_body<'a>(message: &'a Message<'_>) -> Option<&'a str> {
    match message.parts.first().map(|part| &part.body) {
        Some(PartType::Text(text)) | Some(PartType::Html(text)) if message.parts.len() == 1 => {
            Some(&**text)
        }
        _ => message.parts.iter().find_map(|part| {
            let PartType::Text(text) = &part.body else {
                return None;
            };
            let plain = part.content_type().map_or(true, |ct| {
                ct.ctype().eq_ignore_ascii_case("text")
                    && ct.subtype().map_or(true, |s| s.eq_ignore_ascii_case("plain"))
            });
            let attachment = part
                .content_disposition()
                .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"));
            (plain && !attachment).then(|| &**text)
        }),
    }
}

/// Lower-case text for matching. Applying it twice is a no-op.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
}

/// Sanitize a header name: lower-cased, `-` replaced by `_`
pub fn sanitize_header(name: &str) -> String {
    name.trim().to_lowercase().replace('-', "_")
}

/// Naive spam detection from filter headers
fn is_spam(headers: &BTreeMap<String, String>) -> bool {
    let value = |name: &str| headers.get(name).map(String::as_str).unwrap_or("");

    value("x_spam_flag") == "yes"
        || value("x_gnd_status") == "spam"
        // one or more `+` when spam, `/` otherwise
        || value("x_atmail_spam_bar").contains('+')
}

/// Format an address header as `name <addr>` entries, comma-joined, lower-cased
fn format_addresses(address: Option<&Address<'_>>) -> String {
    let Some(address) = address else {
        return String::new();
    };

    let mut formatted = Vec::new();
    let mut push = |name: Option<&str>, addr: Option<&str>| {
        let addr = addr.unwrap_or("");
        match name.filter(|n| !n.is_empty()) {
            Some(name) => formatted.push(format!("{} <{}>", name, addr)),
            None if !addr.is_empty() => formatted.push(addr.to_string()),
            None => {}
        }
    };

    match address {
        Address::List(list) => {
            for addr in list {
                push(addr.name.as_deref(), addr.address.as_deref());
            }
        }
        Address::Group(groups) => {
            for group in groups {
                for addr in &group.addresses {
                    push(addr.name.as_deref(), addr.address.as_deref());
                }
            }
        }
    }

    normalize_text(&formatted.join(", "))
}

/// Decode a raw address header value that mail-parser does not model
/// (`Delivered-To`). Falls back to the lower-cased value when it does not
/// parse as an address list.
fn parse_address_value(value: &str) -> String {
    let wrapped = format!("To: {}\r\n\r\n", value);
    MessageParser::default()
        .parse(wrapped.as_bytes())
        .map(|message| format_addresses(message.to()))
        .filter(|formatted| !formatted.is_empty())
        .unwrap_or_else(|| normalize_text(value.trim()))
}

/// Bytes up to the blank line separating headers from the body
fn header_section(bytes: &[u8]) -> &[u8] {
    let crlf = bytes.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = bytes.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) => &bytes[..a.min(b)],
        (Some(a), None) => &bytes[..a],
        (None, Some(b)) => &bytes[..b],
        (None, None) => bytes,
    }
}

/// UTF-8 when valid, otherwise Latin-1 (every byte maps to one char)
fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Unfold header lines into `(name, value)` pairs, in wire order and case
fn unfold_headers(headers_str: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in headers_str.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            fields.push((name, value));
        }
    }

    fields
}

/// Sanitized header map. The first occurrence of a repeated header wins.
fn parse_headers(fields: &[(String, String)]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (name, value) in fields {
        if !name.is_empty() {
            headers
                .entry(sanitize_header(name))
                .or_insert_with(|| normalize_text(value.trim()));
        }
    }
    headers
}
