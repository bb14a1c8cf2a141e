//! Identifiers
//!
//! Bases, tables, fields and records are addressed by opaque string ids
//! minted by the platform (`bse...`, `tbl...`, `fld...`, `rec...`). Each gets
//! its own newtype so a field id can never be passed where a table id is
//! expected.
//!
//! Outbox tasks are the only ids this crate mints itself; they are UUIDv7 so
//! they sort by creation time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// A base (workspace). The dependency graph is scoped to one base.
    BaseId
);
string_id!(
    /// A table inside a base.
    TableId
);
string_id!(
    /// A field (column) of a table.
    FieldId
);
string_id!(
    /// A record (row) of a table.
    RecordId
);

/// Unique identifier for an outbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new time-ordered task id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the raw UUID.
    pub fn raw(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let id = FieldId::new("fldPrice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"fldPrice\"");
        assert_eq!(id.to_string(), "fldPrice");
    }
}
