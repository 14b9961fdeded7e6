use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::FeedError;

const CANONICAL_FORMAT: &str = "%Y-%m-%d";

/// A calendar date used as a topic key.
///
/// Two dates that render to the same `YYYY-MM-DD` string are the same topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicDate(NaiveDate);

impl TopicDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Parses `YYYY-MM-DD` (zero padding optional) or an RFC 3339 timestamp.
    ///
    /// Timestamps keep the calendar date of their own offset.
    pub fn parse(input: &str) -> Result<Self, FeedError> {
        let trimmed = input.trim();
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, CANONICAL_FORMAT) {
            return Ok(Self(date));
        }
        DateTime::parse_from_rfc3339(trimmed)
            .map(|dt| Self(dt.date_naive()))
            .map_err(|_| FeedError::InvalidDate(input.to_string()))
    }

    /// The canonical topic string.
    pub fn canonical(&self) -> String {
        self.0.format(CANONICAL_FORMAT).to_string()
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// True when `raw` canonicalizes to this topic. Unparseable input never matches.
    pub fn matches(&self, raw: &str) -> bool {
        TopicDate::parse(raw).map(|d| d == *self).unwrap_or(false)
    }
}

impl From<NaiveDate> for TopicDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for TopicDate {
    fn from(dt: DateTime<Tz>) -> Self {
        Self(dt.date_naive())
    }
}

impl FromStr for TopicDate {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicDate::parse(s)
    }
}

impl fmt::Display for TopicDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl Serialize for TopicDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TopicDate::parse(&raw).map_err(serde::de::Error::custom)
    }
}
