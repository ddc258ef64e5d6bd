use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Legacy task identifier: a small positive decimal integer.
///
/// Ticket and PR numbers in the legacy logs run to six digits, so task ids are
/// capped at five to keep the two ranges apart. Anything longer is treated as
/// corrupted input rather than truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    pub const MAX_DIGITS: usize = 5;

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Parse a reference token as written in a legacy document: `#42` or `42`.
    pub fn parse_ref(input: &str) -> Result<Self, TaskIdParseError> {
        let trimmed = input.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed).trim();
        if digits.is_empty() {
            return Err(TaskIdParseError::Empty);
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TaskIdParseError::NonNumeric(digits.to_string()));
        }
        if digits.len() > Self::MAX_DIGITS {
            return Err(TaskIdParseError::TooLong(digits.to_string()));
        }
        // At most five ASCII digits, so this cannot overflow.
        let value: u32 = digits
            .parse()
            .map_err(|_| TaskIdParseError::NonNumeric(digits.to_string()))?;
        if value == 0 {
            return Err(TaskIdParseError::Zero);
        }
        Ok(Self(value))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_ref(s)
    }
}

impl TryFrom<u64> for TaskId {
    type Error = TaskIdParseError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::parse_ref(&value.to_string())
    }
}

impl From<TaskId> for u32 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl PartialEq<u32> for TaskId {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TaskIdVisitor;

        impl serde::de::Visitor<'_> for TaskIdVisitor {
            type Value = TaskId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive task number of at most 5 digits")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                TaskId::try_from(value).map_err(E::custom)
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value < 0 {
                    return Err(E::custom("task number cannot be negative"));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TaskIdVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIdParseError {
    Empty,
    NonNumeric(String),
    TooLong(String),
    Zero,
}

impl fmt::Display for TaskIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "task id cannot be empty"),
            Self::NonNumeric(raw) => write!(f, "task id '{raw}' is not numeric"),
            Self::TooLong(raw) => write!(
                f,
                "task id '{raw}' exceeds {} digits",
                TaskId::MAX_DIGITS
            ),
            Self::Zero => write!(f, "task id must be positive"),
        }
    }
}

impl std::error::Error for TaskIdParseError {}
