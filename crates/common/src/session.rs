use once_cell::sync::Lazy;
use regex::Regex;

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("session id pattern")
});

/// Session ids are canonical hyphenated UUIDs. They end up in relay URL
/// paths and marker file names, so nothing else is accepted.
pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

/// Approval ids are assigned by the relay; only path-safe characters pass.
pub fn is_valid_approval_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
