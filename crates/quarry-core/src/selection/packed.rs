//! # Packed Selections
//!
//! The external form of a selection: a finite tree whose values are the leaf
//! marker, the recursion marker `*`, or a nested packed selection.
//!
//! Two encodings are supported:
//! - text: `{ id, name, branches: * }` (parsed with [`str::parse`])
//! - serde: `{"id": true, "branches": "*", "owner": {"name": true}}`

use crate::QuarryError;
use crate::primitives::{MAX_PACKED_DEPTH, MAX_PACKED_TEXT_LENGTH, WILDCARD};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One value of a packed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackedValue {
    /// Select the property (a relation gets its default sub-selection).
    Leaf,
    /// Recurse: the relation repeats the enclosing selection.
    Wildcard,
    /// Select the relation with an explicit sub-selection.
    Nested(PackedSelection),
}

/// A finite, acyclic selection tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackedSelection {
    entries: BTreeMap<String, PackedValue>,
}

impl PackedSelection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: select `key` as a leaf.
    #[must_use]
    pub fn leaf(mut self, key: &str) -> Self {
        self.insert(key, PackedValue::Leaf);
        self
    }

    /// Builder: select `key` recursively.
    #[must_use]
    pub fn wildcard(mut self, key: &str) -> Self {
        self.insert(key, PackedValue::Wildcard);
        self
    }

    /// Builder: select `key` with a nested selection.
    #[must_use]
    pub fn nested(mut self, key: &str, inner: Self) -> Self {
        self.insert(key, PackedValue::Nested(inner));
        self
    }

    pub fn insert(&mut self, key: &str, value: PackedValue) {
        self.entries.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PackedValue> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackedValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for PackedSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{ ")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                PackedValue::Leaf => write!(f, "{key}")?,
                PackedValue::Wildcard => write!(f, "{key}: {WILDCARD}")?,
                PackedValue::Nested(inner) => write!(f, "{key}: {inner}")?,
            }
        }
        write!(f, " }}")
    }
}

// =============================================================================
// SERDE
// =============================================================================

impl Serialize for PackedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Leaf => serializer.serialize_bool(true),
            Self::Wildcard => serializer.serialize_str(WILDCARD),
            Self::Nested(inner) => inner.serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Flag(bool),
    Marker(String),
    Nested(PackedSelection),
}

impl<'de> Deserialize<'de> for PackedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawValue::deserialize(deserializer)? {
            RawValue::Flag(true) => Ok(Self::Leaf),
            RawValue::Flag(false) => Err(de::Error::custom(
                "unselected properties must be omitted, not set to false",
            )),
            RawValue::Marker(marker) if marker == WILDCARD => Ok(Self::Wildcard),
            RawValue::Marker(marker) => Err(de::Error::custom(format!(
                "unexpected selection marker {marker:?}, expected \"{WILDCARD}\""
            ))),
            RawValue::Nested(inner) => Ok(Self::Nested(inner)),
        }
    }
}

// =============================================================================
// TEXT PARSER
// =============================================================================

impl FromStr for PackedSelection {
    type Err = QuarryError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.len() > MAX_PACKED_TEXT_LENGTH {
            return Err(QuarryError::InvalidSelection {
                offset: MAX_PACKED_TEXT_LENGTH,
                message: format!("text exceeds {MAX_PACKED_TEXT_LENGTH} bytes"),
            });
        }
        let mut parser = Parser { text, pos: 0 };
        parser.skip_whitespace();
        let packed = parser.selection(0)?;
        parser.skip_whitespace();
        if parser.pos != text.len() {
            return Err(parser.error("trailing input after selection"));
        }
        Ok(packed)
    }
}

/// Recursive-descent parser over ASCII input.
struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> QuarryError {
        QuarryError::InvalidSelection {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), QuarryError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", char::from(byte))))
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> Result<&'a str, QuarryError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected property name"));
        }
        self.text
            .get(start..self.pos)
            .ok_or_else(|| self.error("invalid property name"))
    }

    fn selection(&mut self, depth: usize) -> Result<PackedSelection, QuarryError> {
        if depth > MAX_PACKED_DEPTH {
            return Err(self.error("selection nested too deeply"));
        }
        self.expect(b'{')?;
        let mut packed = PackedSelection::new();
        loop {
            self.skip_whitespace();
            if self.eat(b'}') {
                return Ok(packed);
            }
            let key_start = self.pos;
            let key = self.ident()?;
            self.skip_whitespace();
            let value = if self.eat(b':') {
                self.skip_whitespace();
                if self.eat(b'*') {
                    PackedValue::Wildcard
                } else {
                    PackedValue::Nested(self.selection(depth + 1)?)
                }
            } else {
                PackedValue::Leaf
            };
            if packed.entries.contains_key(key) {
                return Err(QuarryError::InvalidSelection {
                    offset: key_start,
                    message: format!("duplicate key {key}"),
                });
            }
            packed.insert(key, value);
            self.skip_whitespace();
            if !self.eat(b',') {
                self.expect(b'}')?;
                return Ok(packed);
            }
        }
    }
}
