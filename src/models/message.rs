//! Message model
//!
//! A [`Message`] is the unit handed to handlers and produced to topics. It
//! keeps two views of its headers, one as text and one as raw bytes, and
//! every mutation goes through methods that update both so that they never
//! drift apart.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::duration::{format_duration, parse_duration, MAX_HEADER_DURATION};
use super::offset::Offset;

/// Header carrying the time a message should be held back before handling
pub const DEFERRAL_HEADER: &str = "topicflow:deferred";

/// Header carrying the id of the retry attempt a message belongs to
pub const RETRY_ATTEMPT_HEADER: &str = "topicflow:retry-attempt";

/// Header carrying how many times a message has been retried
pub const RETRY_NUM_HEADER: &str = "topicflow:retry-num";

/// A message consumed from, or to be produced to, a topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// When the broker recorded the message
    pub timestamp: Option<DateTime<Utc>>,
    /// Time elapsed between `timestamp` and the message being read
    pub age: Option<Duration>,
    headers: BTreeMap<String, String>,
    raw_headers: BTreeMap<String, Vec<u8>>,
}

impl Message {
    /// Create a message for `topic` with the given value
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Set the message key, returning the message
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn raw_header(&self, key: &str) -> Option<&[u8]> {
        self.raw_headers.get(key).map(Vec::as_slice)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn raw_headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.raw_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Set a header from text
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.raw_headers.insert(key.clone(), value.clone().into_bytes());
        self.headers.insert(key, value);
    }

    /// Set a header from bytes; the text view holds a lossy UTF-8 rendering
    pub fn set_raw_header(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        self.headers
            .insert(key.clone(), String::from_utf8_lossy(&value).into_owned());
        self.raw_headers.insert(key, value);
    }

    pub fn remove_header(&mut self, key: &str) {
        self.headers.remove(key);
        self.raw_headers.remove(key);
    }

    /// Mark the message to be held back for `d` after it was produced
    pub fn defer_for(&mut self, d: Duration) {
        self.set_header(DEFERRAL_HEADER, format_duration(d.min(MAX_HEADER_DURATION)));
    }

    /// The deferral requested for this message, if any
    ///
    /// An unparseable deferral header is treated as no deferral.
    pub fn deferral(&self) -> Option<Duration> {
        self.header(DEFERRAL_HEADER).and_then(parse_duration)
    }

    /// True if the deferral period has not yet elapsed
    pub fn should_defer(&self) -> bool {
        match self.deferral() {
            Some(d) => d > self.age.unwrap_or_default(),
            None => false,
        }
    }

    /// Returns `(is_retry, attempt, num)` read from the retry headers
    ///
    /// Missing or unparseable headers read as zero.
    pub fn retry_attempt(&self) -> (bool, u64, u64) {
        let read = |key: &str| {
            self.header(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        };
        let attempt = read(RETRY_ATTEMPT_HEADER);
        let num = read(RETRY_NUM_HEADER);
        (attempt != 0 || num != 0, attempt, num)
    }

    /// Write the retry headers; an attempt id of 0 is stored as 1
    pub fn set_retry_headers(&mut self, attempt: u64, num: u64) {
        let attempt = if attempt == 0 { 1 } else { attempt };
        self.set_header(RETRY_ATTEMPT_HEADER, attempt.to_string());
        self.set_header(RETRY_NUM_HEADER, num.to_string());
    }

    /// A copy suitable for producing to another topic
    ///
    /// Key, value and headers are kept, apart from any deferral. The copy has
    /// no topic and no broker-assigned fields.
    pub fn new_copy(&self) -> Self {
        let mut copy = Self {
            key: self.key.clone(),
            value: self.value.clone(),
            headers: self.headers.clone(),
            raw_headers: self.raw_headers.clone(),
            ..Default::default()
        };
        copy.remove_header(DEFERRAL_HEADER);
        copy
    }

    /// The broker address of the message, when it has one
    pub fn address(&self) -> Option<Offset> {
        Some(Offset::new(
            self.topic.clone(),
            self.partition?,
            self.offset?,
        ))
    }

    /// A loggable summary of the message
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: (!self.key.is_empty()).then(|| String::from_utf8_lossy(&self.key).into_owned()),
            headers: self.headers.clone(),
            timestamp: self.timestamp,
            age: self.age.map(format_duration),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topic = if self.topic.is_empty() {
            "<no topic>"
        } else {
            self.topic.as_str()
        };
        match (self.partition, self.offset) {
            (Some(p), Some(o)) => write!(f, "{} @ {}:{}", topic, p, o)?,
            _ => write!(f, "{} @ <unassigned>", topic)?,
        }
        match (self.timestamp, self.age) {
            (Some(ts), Some(age)) => {
                write!(f, " [{} / {}]", ts.to_rfc3339(), format_duration(age))
            }
            (Some(ts), None) => write!(f, " [{}]", ts.to_rfc3339()),
            _ => Ok(()),
        }
    }
}

/// Structured description of a message for log output
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
}

impl fmt::Display for MessageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{{\"topic\":\"{}\"}}", self.topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_header_views_stay_in_step() {
        let mut msg = Message::new("orders", "v");
        msg.set_header("a", "1");
        msg.set_raw_header("b", vec![b'2']);

        assert_eq!(msg.header("a"), Some("1"));
        assert_eq!(msg.raw_header("a"), Some(&b"1"[..]));
        assert_eq!(msg.header("b"), Some("2"));
        assert_eq!(msg.raw_header("b"), Some(&b"2"[..]));

        msg.remove_header("a");
        assert_eq!(msg.header("a"), None);
        assert_eq!(msg.raw_header("a"), None);
        assert_eq!(msg.headers().count(), msg.raw_headers().count());
    }

    #[test]
    fn test_should_defer() {
        let mut msg = Message::new("orders", "v");
        assert!(!msg.should_defer());

        msg.defer_for(Duration::from_secs(2));
        msg.age = Some(Duration::from_secs(1));
        assert!(msg.should_defer());

        msg.age = Some(Duration::from_secs(3));
        assert!(!msg.should_defer());

        msg.age = None;
        assert!(msg.should_defer());
    }

    #[test]
    fn test_unparseable_deferral_is_ignored() {
        let mut msg = Message::new("orders", "v");
        msg.set_header(DEFERRAL_HEADER, "soon");
        assert_eq!(msg.deferral(), None);
        assert!(!msg.should_defer());
    }

    #[test]
    fn test_retry_headers() {
        let mut msg = Message::new("orders", "v");
        assert_eq!(msg.retry_attempt(), (false, 0, 0));

        msg.set_retry_headers(0, 1);
        assert_eq!(msg.header(RETRY_ATTEMPT_HEADER), Some("1"));
        assert_eq!(msg.retry_attempt(), (true, 1, 1));

        msg.set_header(RETRY_NUM_HEADER, "not-a-number");
        assert_eq!(msg.retry_attempt(), (true, 1, 0));
    }

    #[test]
    fn test_new_copy() {
        let mut msg = Message::new("orders", "payload").with_key("k");
        msg.partition = Some(3);
        msg.offset = Some(99);
        msg.timestamp = Some(Utc::now());
        msg.age = Some(Duration::from_secs(1));
        msg.set_header("trace", "abc");
        msg.defer_for(Duration::from_secs(5));

        let copy = msg.new_copy();
        assert_eq!(copy.topic, "");
        assert_eq!(copy.partition, None);
        assert_eq!(copy.offset, None);
        assert_eq!(copy.timestamp, None);
        assert_eq!(copy.age, None);
        assert_eq!(copy.key, b"k");
        assert_eq!(copy.value, b"payload");
        assert_eq!(copy.header("trace"), Some("abc"));
        assert_eq!(copy.header(DEFERRAL_HEADER), None);
        assert_eq!(copy.raw_header(DEFERRAL_HEADER), None);
    }

    #[test]
    fn test_address() {
        let mut msg = Message::new("orders", "v");
        assert_eq!(msg.address(), None);
        msg.partition = Some(1);
        msg.offset = Some(7);
        assert_eq!(msg.address(), Some(Offset::new("orders", 1, 7)));
    }

    #[test]
    fn test_display() {
        let mut msg = Message::new("orders", "v");
        assert_eq!(msg.to_string(), "orders @ <unassigned>");

        msg.partition = Some(1);
        msg.offset = Some(7);
        msg.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        msg.age = Some(Duration::from_millis(1500));
        assert_eq!(msg.to_string(), "orders @ 1:7 [2024-01-02T03:04:05+00:00 / 1.5s]");
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let mut msg = Message::new("orders", "v").with_key("k");
        msg.set_header("trace", "abc");

        let json: serde_json::Value = serde_json::from_str(&msg.summary().to_string()).unwrap();
        assert_eq!(json["topic"], "orders");
        assert_eq!(json["key"], "k");
        assert_eq!(json["headers"]["trace"], "abc");
        assert!(json.get("partition").is_none());
    }
}
