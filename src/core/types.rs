use serde::{Deserialize, Serialize};

/// Version reported when no migration has been applied.
pub const NIL_VERSION: i64 = -1;

/// The durable checkpoint kept in the migrations table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: i64,
    pub dirty: bool,
}

impl VersionRecord {
    pub fn new(version: i64, dirty: bool) -> Self {
        Self { version, dirty }
    }

    /// State of a ledger nothing has been applied to
    pub fn nil() -> Self {
        Self::new(NIL_VERSION, false)
    }

    pub fn is_nil(&self) -> bool {
        self.version == NIL_VERSION && !self.dirty
    }

    /// Whether this record has to be stored at all.
    ///
    /// A clean nil version is represented by an empty table.
    pub fn is_persisted(&self) -> bool {
        self.version >= 0 || (self.version == NIL_VERSION && self.dirty)
    }
}

impl Default for VersionRecord {
    fn default() -> Self {
        Self::nil()
    }
}

impl From<VersionRecord> for (i64, bool) {
    fn from(record: VersionRecord) -> Self {
        (record.version, record.dirty)
    }
}

impl std::fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}
