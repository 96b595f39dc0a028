//! Identifiers of the shared object space.
//!
//! Every replicated object is addressed by a string of the form
//! `/<TypeName>#<id>`:
//!
//! ```text
//! /TodoItem#9b1d…   /Text#9b1d…   /TodoList#todos
//!  └─ type ─┘ └id┘
//! ```
//!
//! The type name selects the schema the object was created with; the id
//! token is what the UI sees. A TodoItem and its Text share one token.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const TODO_ITEM_TYPE: &str = "TodoItem";
pub const TEXT_TYPE: &str = "Text";
pub const TODO_LIST_TYPE: &str = "TodoList";

/// Token of the process-wide list (`/TodoList#todos`).
pub const DEFAULT_LIST_TOKEN: &str = "todos";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must start with '/': {0:?}")]
    MissingSlash(String),
    #[error("identifier has no '#' separator: {0:?}")]
    MissingHash(String),
    #[error("invalid type name: {0:?}")]
    InvalidType(String),
    #[error("invalid id token: {0:?}")]
    InvalidToken(String),
    #[error("expected a {expected} identifier, got {actual}")]
    WrongType { expected: &'static str, actual: String },
}

/// A validated `/<TypeName>#<id>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    full: String,
    /// Byte offset of the `#` separator in `full`.
    hash: usize,
}

impl ObjectId {
    pub fn new(type_name: &str, token: &str) -> Result<Self, IdError> {
        validate_type(type_name)?;
        validate_token(token)?;
        Ok(Self {
            full: format!("/{type_name}#{token}"),
            hash: type_name.len() + 1,
        })
    }

    /// Parse a full identifier string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| IdError::MissingSlash(s.to_string()))?;
        let (type_name, token) = rest
            .split_once('#')
            .ok_or_else(|| IdError::MissingHash(s.to_string()))?;
        Self::new(type_name, token)
    }

    pub fn todo_item(token: &str) -> Result<Self, IdError> {
        Self::new(TODO_ITEM_TYPE, token)
    }

    pub fn text(token: &str) -> Result<Self, IdError> {
        Self::new(TEXT_TYPE, token)
    }

    pub fn todo_list(token: &str) -> Result<Self, IdError> {
        Self::new(TODO_LIST_TYPE, token)
    }

    pub fn type_name(&self) -> &str {
        &self.full[1..self.hash]
    }

    /// The id token, without type prefix.
    pub fn token(&self) -> &str {
        &self.full[self.hash + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn is_type(&self, type_name: &str) -> bool {
        self.type_name() == type_name
    }

    /// Fail unless this identifier names an object of `expected` type.
    pub fn require_type(self, expected: &'static str) -> Result<Self, IdError> {
        if self.is_type(expected) {
            Ok(self)
        } else {
            Err(IdError::WrongType {
                expected,
                actual: self.full,
            })
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.full
    }
}

/// A fresh id token for a newly created object.
///
/// Random v4 UUIDs: two replicas creating items within the same clock
/// tick still get distinct tokens.
pub fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn validate_type(type_name: &str) -> Result<(), IdError> {
    let mut chars = type_name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(IdError::InvalidType(type_name.to_string()))
    }
}

fn validate_token(token: &str) -> Result<(), IdError> {
    let valid = !token.is_empty()
        && !token
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '#');
    if valid {
        Ok(())
    } else {
        Err(IdError::InvalidToken(token.to_string()))
    }
}
