//! Structured error kinds for the compiler and execution engine.
//!
//! The teacher crate this is derived from reports everything through
//! `anyhow::Error` because its callers only ever print-and-abort. Tacit's
//! top-level driver needs to branch on *which* error happened (reset the
//! data stack on a `StackUnderflow`, reset the compiler's `CP` on a
//! `NestingError`, and so on), so errors here are a concrete enum.

use thiserror::Error;

/// Every fatal error kind the core can raise (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("data stack underflow: needed {needed} cell(s), had {available}")]
    StackUnderflow { needed: usize, available: usize },

    #[error("stack overflow: segment {segment} is full")]
    StackOverflow { segment: &'static str },

    #[error("invalid tag value {0}")]
    InvalidTag(u8),

    #[error("payload {value} out of range for tag {tag} (max {max})")]
    OutOfRange {
        tag: &'static str,
        value: i64,
        max: i64,
    },

    #[error("unknown word: {0:?}")]
    UnknownWord(String),

    #[error("nesting error: {0}")]
    NestingError(&'static str),

    #[error("shape mismatch: cannot store {new_shape} over {old_shape}")]
    ShapeMismatch {
        old_shape: &'static str,
        new_shape: &'static str,
    },

    #[error("segment overflow: {segment} write at {offset} exceeds capacity {capacity}")]
    SegmentOverflow {
        segment: &'static str,
        offset: usize,
        capacity: usize,
    },

    #[error("type error: {context} expected {expected}, found {found}")]
    TypeError {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("resume on uninitialized frame at return-stack cell {0}")]
    UninitializedResume(u32),

    #[error("self-reentry: eval invoked on the currently active frame")]
    SelfReentry,

    #[error("string segment full: cannot intern {len} more byte(s)")]
    StringSegmentFull { len: usize },

    #[error("snapshot I/O error: {0}")]
    Io(String),
}

pub type VmResult<T> = Result<T, VmError>;
