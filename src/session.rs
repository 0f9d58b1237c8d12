//! Conversation sessions, the extraction watermark, and delta scanning

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::UserKey;
use crate::message::{Message, Response};

/// Session state key holding the timestamp of the last event handed to
/// memory extraction. Must stay stable across releases.
pub const LAST_EXTRACT_AT_KEY: &str = "auto_memory.last_extract_at";

/// A timestamped entry in a session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,

    /// Who produced the event (user, agent name, tool)
    pub author: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl Event {
    pub fn new(author: impl Into<String>, timestamp: DateTime<Utc>, response: Option<Response>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            author: author.into(),
            timestamp,
            response,
        }
    }

    /// Event carrying a single message
    pub fn with_message(author: impl Into<String>, timestamp: DateTime<Utc>, message: Message) -> Self {
        Self::new(author, timestamp, Some(Response::from_message(message)))
    }
}

/// Append-only log of events for one app/user/session, plus a state map.
///
/// Shared between the agent runtime and the memory worker, hence the
/// interior locking.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    events: RwLock<Vec<Event>>,
    state: RwLock<HashMap<String, Vec<u8>>>,
}

impl Session {
    /// Create a new empty session with a random ID
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), app_name, user_id)
    }

    pub fn with_id(id: impl Into<String>, app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app_name: app_name.into(),
            user_id: user_id.into(),
            events: RwLock::new(Vec::new()),
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.app_name.clone(), self.user_id.clone())
    }

    pub fn append_event(&self, event: Event) {
        self.events.write().push(event);
    }

    /// Snapshot of the event log
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn get_state(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().get(key).cloned()
    }

    pub fn set_state(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.state.write().insert(key.into(), value.into());
    }
}

/// Read the extraction watermark. Missing or unparsable values read as `None`.
pub fn read_last_extract_at(session: &Session) -> Option<DateTime<Utc>> {
    let raw = session.get_state(LAST_EXTRACT_AT_KEY)?;
    let raw = std::str::from_utf8(&raw).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Advance the extraction watermark.
///
/// An older timestamp than the stored one is ignored so the watermark never
/// moves backwards, even when jobs for one session finish out of order.
pub fn write_last_extract_at(session: &Session, ts: DateTime<Utc>) {
    let mut state = session.state.write();
    let current = state
        .get(LAST_EXTRACT_AT_KEY)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc));
    if matches!(current, Some(current) if current >= ts) {
        return;
    }
    state.insert(LAST_EXTRACT_AT_KEY.to_string(), format_timestamp(ts).into_bytes());
}

/// RFC 3339, UTC, nanosecond precision when needed
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Result of scanning a session past a watermark
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    /// Newest timestamp among scanned events, conversational or not
    pub latest: Option<DateTime<Utc>>,

    /// Conversational messages in session order
    pub messages: Vec<Message>,
}

/// Collect user/assistant messages newer than `since`.
///
/// Only the first choice of each event is considered. Tool results, tool-call
/// requests and blank messages are skipped but still advance `latest`, so
/// scaffolding is never rescanned.
pub fn scan_delta_since(session: &Session, since: Option<DateTime<Utc>>) -> Delta {
    let events = session.events.read();
    let mut delta = Delta::default();

    for event in events.iter() {
        if matches!(since, Some(since) if event.timestamp <= since) {
            continue;
        }
        if delta.latest.map_or(true, |latest| event.timestamp > latest) {
            delta.latest = Some(event.timestamp);
        }

        let Some(message) = event.response.as_ref().and_then(Response::first_message) else {
            continue;
        };
        if message.is_conversational() {
            delta.messages.push(message.clone());
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn session() -> Session {
        Session::new("app", "u1")
    }

    #[test]
    fn watermark_round_trips_with_nanoseconds() {
        let sess = session();
        let ts = Utc.timestamp_opt(1_741_944_423, 123_456_789).unwrap();
        write_last_extract_at(&sess, ts);

        let raw = sess.get_state(LAST_EXTRACT_AT_KEY).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), "2025-03-14T09:27:03.123456789Z");
        assert_eq!(read_last_extract_at(&sess), Some(ts));
    }

    #[test]
    fn whole_second_watermark_has_no_fraction() {
        let sess = session();
        write_last_extract_at(&sess, t(0));
        let raw = sess.get_state(LAST_EXTRACT_AT_KEY).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), "2025-01-01T00:00:00Z");
    }

    #[test]
    fn missing_or_malformed_watermark_reads_as_none() {
        let sess = session();
        assert_eq!(read_last_extract_at(&sess), None);

        sess.set_state(LAST_EXTRACT_AT_KEY, "yesterday-ish");
        assert_eq!(read_last_extract_at(&sess), None);

        sess.set_state(LAST_EXTRACT_AT_KEY, vec![0xff, 0xfe]);
        assert_eq!(read_last_extract_at(&sess), None);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let sess = session();
        write_last_extract_at(&sess, t(10));
        write_last_extract_at(&sess, t(5));
        assert_eq!(read_last_extract_at(&sess), Some(t(10)));

        write_last_extract_at(&sess, t(20));
        assert_eq!(read_last_extract_at(&sess), Some(t(20)));
    }

    #[test]
    fn scan_skips_tool_scaffolding() {
        let sess = session();
        sess.append_event(Event::with_message("user", t(1), Message::user("who am I")));
        sess.append_event(Event::with_message(
            "agent",
            t(2),
            Message::assistant("").with_tool_calls(vec![ToolCall::new("c1", "search", "{}")]),
        ));
        sess.append_event(Event::with_message("tool", t(3), Message::tool("search", "c1", "X")));
        sess.append_event(Event::with_message("agent", t(4), Message::assistant("you are X")));

        let delta = scan_delta_since(&sess, None);
        assert_eq!(delta.latest, Some(t(4)));
        assert_eq!(
            delta.messages,
            vec![Message::user("who am I"), Message::assistant("you are X")]
        );
    }

    #[test]
    fn skipped_events_still_advance_latest() {
        let sess = session();
        sess.append_event(Event::with_message("user", t(1), Message::user("hello")));
        sess.append_event(Event::new("agent", t(2), None));
        sess.append_event(Event::new("agent", t(3), Some(Response::default())));
        sess.append_event(Event::with_message("agent", t(4), Message::assistant("  ")));

        let delta = scan_delta_since(&sess, None);
        assert_eq!(delta.latest, Some(t(4)));
        assert_eq!(delta.messages.len(), 1);
    }

    #[test]
    fn scan_is_exclusive_of_lower_bound() {
        let sess = session();
        sess.append_event(Event::with_message("user", t(1), Message::user("old")));
        sess.append_event(Event::with_message("user", t(2), Message::user("new")));

        let delta = scan_delta_since(&sess, Some(t(1)));
        assert_eq!(delta.messages, vec![Message::user("new")]);
        assert_eq!(delta.latest, Some(t(2)));
    }

    #[test]
    fn future_lower_bound_yields_nothing() {
        let sess = session();
        sess.append_event(Event::with_message("user", t(1), Message::user("hi")));

        let delta = scan_delta_since(&sess, Some(t(100)));
        assert!(delta.messages.is_empty());
        assert_eq!(delta.latest, None);
    }

    #[test]
    fn empty_session_has_no_latest() {
        assert_eq!(scan_delta_since(&session(), None), Delta::default());
    }
}
