//! Resumption tokens.
//!
//! A token records how far a reader has progressed through the event log, or
//! narrows what it reads. Tokens form a closed set: storage engines compile them
//! with an exhaustive `match`, so adding a variant is a compile error everywhere
//! it is not handled yet.
//!
//! An absent token (`Option::None`) means an unfiltered read from the start of
//! the log.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Global log position assigned by storage on insert.
pub type Position = i64;

/// How far a reader has progressed, or which events it wants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ResumptionToken {
    /// Last position already consumed; reading resumes strictly after it.
    Positional(Position),
    /// Read up to and including this position.
    UpperBound(Position),
    /// Read the half-open range `(lower, upper]`.
    Bounded {
        /// Exclusive lower bound.
        lower: Position,
        /// Inclusive upper bound.
        upper: Position,
    },
    /// Only events whose payload type is in the set.
    Payload(BTreeSet<String>),
    /// Only events of one aggregate.
    AggregateIdentifier(String),
    /// All member tokens apply at once.
    Combined(Vec<ResumptionToken>),
}

impl ResumptionToken {
    /// Token for the very start of the log.
    pub fn head() -> Self {
        Self::Positional(0)
    }

    /// Payload filter from any collection of type names.
    pub fn payload<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Payload(types.into_iter().map(Into::into).collect())
    }

    /// Conjunction of several tokens.
    pub fn combined(tokens: impl IntoIterator<Item = ResumptionToken>) -> Self {
        Self::Combined(tokens.into_iter().collect())
    }

    /// The consumed position this token records, if it is (or contains) a
    /// [`ResumptionToken::Positional`].
    pub fn position(&self) -> Option<Position> {
        match self {
            Self::Positional(position) => Some(*position),
            Self::Combined(tokens) => tokens.iter().find_map(Self::position),
            Self::UpperBound(_)
            | Self::Bounded { .. }
            | Self::Payload(_)
            | Self::AggregateIdentifier(_) => None,
        }
    }
}

impl fmt::Display for ResumptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positional(position) => write!(f, "positional({position})"),
            Self::UpperBound(position) => write!(f, "upperBound({position})"),
            Self::Bounded { lower, upper } => write!(f, "bounded({lower}, {upper}]"),
            Self::Payload(types) => {
                let types: Vec<&str> = types.iter().map(String::as_str).collect();
                write!(f, "payload{{{}}}", types.join(","))
            }
            Self::AggregateIdentifier(id) => write!(f, "aggregate({id})"),
            Self::Combined(tokens) => {
                let parts: Vec<String> = tokens.iter().map(ToString::to_string).collect();
                write!(f, "combined[{}]", parts.join(", "))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
