//! IMAP Response parsing
//!
//! Parses server responses read by the session. A response is one logical
//! line; `{n}` literals announced at the end of a physical line are read
//! separately and kept alongside the text.

use mailjudge_common::types::Uid;

/// IMAP response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl ResponseStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Some(ResponseStatus::Ok),
            "NO" => Some(ResponseStatus::No),
            "BAD" => Some(ResponseStatus::Bad),
            "BYE" => Some(ResponseStatus::Bye),
            "PREAUTH" => Some(ResponseStatus::Preauth),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::No => write!(f, "NO"),
            ResponseStatus::Bad => write!(f, "BAD"),
            ResponseStatus::Bye => write!(f, "BYE"),
            ResponseStatus::Preauth => write!(f, "PREAUTH"),
        }
    }
}

/// One logical server response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImapResponse {
    /// Response text with literal markers left in place
    pub text: String,
    /// Literal payloads in order of appearance
    pub literals: Vec<Vec<u8>>,
}

impl ImapResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            literals: Vec::new(),
        }
    }

    /// Tagged completion: `(tag, status, text)`
    pub fn tagged(&self) -> Option<(&str, ResponseStatus, &str)> {
        if self.is_untagged() || self.is_continuation() {
            return None;
        }
        let (tag, rest) = self.text.split_once(' ')?;
        let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
        Some((tag, ResponseStatus::parse(status)?, text.trim()))
    }

    pub fn is_untagged(&self) -> bool {
        self.text.starts_with("* ")
    }

    pub fn is_continuation(&self) -> bool {
        self.text.starts_with('+')
    }

    /// Status of an untagged status response (`* OK`, `* BYE`, ...)
    pub fn untagged_status(&self) -> Option<ResponseStatus> {
        let rest = self.text.strip_prefix("* ")?;
        let word = rest.split_whitespace().next()?;
        ResponseStatus::parse(word)
    }

    /// UIDs of a `* SEARCH` response
    pub fn search_uids(&self) -> Option<Vec<Uid>> {
        let rest = self.text.strip_prefix("* ")?;
        let mut words = rest.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case("SEARCH") {
            return None;
        }
        Some(words.filter_map(|w| w.parse().ok()).collect())
    }

    /// UID and body of a `* n FETCH (UID u BODY[] {len})` response.
    ///
    /// Returns `None` for FETCH responses without a literal payload, such
    /// as unsolicited flag updates.
    pub fn into_fetched(self) -> Option<(Uid, Vec<u8>)> {
        let rest = self.text.strip_prefix("* ")?;
        let mut words = rest.splitn(3, ' ');
        words.next()?.parse::<u32>().ok()?;
        if !words.next()?.eq_ignore_ascii_case("FETCH") {
            return None;
        }
        let items = words.next()?;

        let tokens: Vec<&str> = items
            .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .filter(|t| !t.is_empty())
            .collect();
        let uid = tokens
            .windows(2)
            .find(|w| w[0].eq_ignore_ascii_case("UID"))
            .and_then(|w| w[1].parse().ok())?;

        let body = self.literals.into_iter().next()?;
        Some((uid, body))
    }
}

/// Length of the literal announced at the end of a line (`... {42}`)
pub fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

/// Decode a response line; invalid UTF-8 is replaced rather than rejected
pub fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(&['\r', '\n'][..]).to_string()
}
