//! Record identity
//!
//! Records created while the server is unreachable (or before the server has
//! answered) carry a [`LocalId`]. Whether an id is pending is a property of the
//! [`RecordId`] variant, never of the id's text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Episode,
    Encounter,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Patient, EntityKind::Episode, EntityKind::Encounter];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Episode => "episode",
            EntityKind::Encounter => "encounter",
        }
    }

    /// REST collection segment, e.g. `/patients`
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Episode => "episodes",
            EntityKind::Encounter => "encounters",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" | "patients" => Ok(EntityKind::Patient),
            "episode" | "episodes" => Ok(EntityKind::Episode),
            "encounter" | "encounters" => Ok(EntityKind::Encounter),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Client-generated identity of a record the server has not confirmed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId {
    pub kind: EntityKind,
    pub uuid: Uuid,
}

impl LocalId {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            uuid: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}-{}", self.kind, self.uuid)
    }
}

impl FromStr for LocalId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("local-")
            .ok_or_else(|| format!("not a local id: {s}"))?;
        let (kind, uuid) = rest
            .split_once('-')
            .ok_or_else(|| format!("not a local id: {s}"))?;
        Ok(Self {
            kind: kind.parse()?,
            uuid: Uuid::parse_str(uuid).map_err(|e| e.to_string())?,
        })
    }
}

/// Identity of a record, or of a record it references
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum RecordId {
    /// Created locally; the server has not assigned an id yet
    Pending(LocalId),
    /// Server-assigned id
    Confirmed(String),
}

impl RecordId {
    pub fn pending(kind: EntityKind) -> Self {
        RecordId::Pending(LocalId::new(kind))
    }

    pub fn confirmed(id: impl Into<String>) -> Self {
        RecordId::Confirmed(id.into())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RecordId::Pending(_))
    }

    pub fn as_confirmed(&self) -> Option<&str> {
        match self {
            RecordId::Confirmed(id) => Some(id),
            RecordId::Pending(_) => None,
        }
    }

    pub fn as_pending(&self) -> Option<&LocalId> {
        match self {
            RecordId::Pending(local) => Some(local),
            RecordId::Confirmed(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Pending(local) => local.fmt(f),
            RecordId::Confirmed(id) => f.write_str(id),
        }
    }
}

impl From<LocalId> for RecordId {
    fn from(local: LocalId) -> Self {
        RecordId::Pending(local)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Confirmed(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId::Confirmed(id)
    }
}
