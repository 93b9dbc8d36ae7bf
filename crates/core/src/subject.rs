//! Typed subject identity.
//!
//! A subject is the entity events are about: a captured link, a sensor, a
//! todo, an annotation. Subjects are referenced by events long before any
//! registry row exists; the registry is a projection, never a constraint.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The kind of entity a subject id identifies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Link,
    Sensor,
    Todo,
    Annotation,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Link => "link",
            SubjectKind::Sensor => "sensor",
            SubjectKind::Todo => "todo",
            SubjectKind::Annotation => "annotation",
        }
    }
}

impl core::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "link" => Ok(SubjectKind::Link),
            "sensor" => Ok(SubjectKind::Sensor),
            "todo" => Ok(SubjectKind::Todo),
            "annotation" => Ok(SubjectKind::Annotation),
            other => Err(DomainError::invalid_id(format!(
                "unknown subject kind: {other}"
            ))),
        }
    }
}

/// A stable subject identifier, e.g. `link:3b2a9f10c4d1e8aa`.
///
/// The string embeds the kind prefix so it can travel alone as a bus message
/// key and still identify its partition and table family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Build an id from a kind and an already-stable local part.
    pub fn new(kind: SubjectKind, local: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", kind.as_str(), local.as_ref()))
    }

    /// The kind prefix, if the id carries a known one.
    pub fn kind(&self) -> Option<SubjectKind> {
        self.0.split_once(':').and_then(|(k, _)| k.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A typed subject reference `(kind, id)` as events carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl Subject {
    pub fn new(kind: SubjectKind, id: SubjectId) -> Self {
        Self { kind, id }
    }

    pub fn link(id: SubjectId) -> Self {
        Self::new(SubjectKind::Link, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_id_embeds_kind_prefix() {
        let id = SubjectId::new(SubjectKind::Link, "abc123");
        assert_eq!(id.as_str(), "link:abc123");
        assert_eq!(id.kind(), Some(SubjectKind::Link));
    }

    #[test]
    fn unknown_prefix_has_no_kind() {
        let id = SubjectId::from("mystery:xyz");
        assert_eq!(id.kind(), None);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            SubjectKind::Link,
            SubjectKind::Sensor,
            SubjectKind::Todo,
            SubjectKind::Annotation,
        ] {
            assert_eq!(kind.as_str().parse::<SubjectKind>().unwrap(), kind);
        }
    }
}
