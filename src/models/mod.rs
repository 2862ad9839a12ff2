//! Data models for topicflow
//!
//! Messages, their broker addresses and the header conventions used to carry
//! retry and deferral bookkeeping between producers and consumers.

pub mod duration;
pub mod message;
pub mod offset;

pub use duration::{format_duration, parse_duration, MAX_HEADER_DURATION};
pub use message::{
    Message, MessageSummary, DEFERRAL_HEADER, RETRY_ATTEMPT_HEADER, RETRY_NUM_HEADER,
};
pub use offset::{CommitIntent, Offset};
