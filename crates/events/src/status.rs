//! Link lifecycle status machine and visibility.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use lifestream_core::DomainError;

/// Projected lifecycle status of a link subject.
///
/// The happy path is `new → fetched → enriched → published`; any non-terminal
/// status can drop to `error`. Enrichment may promote straight from `new`
/// (recovery replays skip the fetch stage), but `fetched → published` is not
/// a legal edge; publication requires enrichment first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    New,
    Fetched,
    Enriched,
    Published,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::New => "new",
            LinkStatus::Fetched => "fetched",
            LinkStatus::Enriched => "enriched",
            LinkStatus::Published => "published",
            LinkStatus::Error => "error",
        }
    }

    /// Position on the forward path; `error` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            LinkStatus::New => Some(0),
            LinkStatus::Fetched => Some(1),
            LinkStatus::Enriched => Some(2),
            LinkStatus::Published => Some(3),
            LinkStatus::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Published)
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition(&self, to: LinkStatus) -> bool {
        use LinkStatus::*;
        match (self, to) {
            (New, Fetched) => true,
            (New, Enriched) | (Fetched, Enriched) => true,
            (Enriched, Published) => true,
            // Any non-terminal status can fail.
            (New, Error) | (Fetched, Error) | (Enriched, Error) => true,
            _ => false,
        }
    }

    /// True when moving to `to` would lose forward progress.
    pub fn would_downgrade(&self, to: LinkStatus) -> bool {
        match (self.rank(), to.rank()) {
            (Some(from), Some(to)) => to < from,
            _ => false,
        }
    }
}

impl core::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LinkStatus::New),
            "fetched" => Ok(LinkStatus::Fetched),
            "enriched" => Ok(LinkStatus::Enriched),
            "published" => Ok(LinkStatus::Published),
            "error" => Ok(LinkStatus::Error),
            other => Err(DomainError::validation(format!(
                "unknown link status: {other}"
            ))),
        }
    }
}

/// Subject visibility in the read model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl core::fmt::Display for Visibility {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(DomainError::validation(format!(
                "unknown visibility: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(LinkStatus::New.can_transition(LinkStatus::Fetched));
        assert!(LinkStatus::Fetched.can_transition(LinkStatus::Enriched));
        assert!(LinkStatus::Enriched.can_transition(LinkStatus::Published));
    }

    #[test]
    fn recovery_may_skip_fetch() {
        assert!(LinkStatus::New.can_transition(LinkStatus::Enriched));
    }

    #[test]
    fn publication_requires_enrichment() {
        assert!(!LinkStatus::Fetched.can_transition(LinkStatus::Published));
        assert!(!LinkStatus::New.can_transition(LinkStatus::Published));
    }

    #[test]
    fn non_terminal_statuses_can_fail() {
        assert!(LinkStatus::New.can_transition(LinkStatus::Error));
        assert!(LinkStatus::Fetched.can_transition(LinkStatus::Error));
        assert!(LinkStatus::Enriched.can_transition(LinkStatus::Error));
        assert!(!LinkStatus::Published.can_transition(LinkStatus::Error));
    }

    #[test]
    fn downgrades_are_detected() {
        assert!(LinkStatus::Published.would_downgrade(LinkStatus::New));
        assert!(LinkStatus::Enriched.would_downgrade(LinkStatus::Fetched));
        assert!(!LinkStatus::New.would_downgrade(LinkStatus::Fetched));
        assert!(!LinkStatus::Error.would_downgrade(LinkStatus::New));
    }
}
