//! Message addresses and commit intents

use serde::{Deserialize, Serialize};
use std::fmt;

/// The address of a message on the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Offset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.topic, self.partition, self.offset)
    }
}

/// What a commit for an offset should mean for the consumer group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitIntent {
    /// The message was handled; the group resumes after it
    ReadNext,
    /// The group resumes at the message itself
    ReadAgain,
}

impl CommitIntent {
    /// Amount added to a message offset to form the committed position
    pub fn adjustment(self) -> i64 {
        match self {
            CommitIntent::ReadNext => 1,
            CommitIntent::ReadAgain => 0,
        }
    }

    /// The position committed for `offset` under this intent
    pub fn committed_offset(self, offset: &Offset) -> i64 {
        offset.offset + self.adjustment()
    }
}
