//! Decoded change events delivered to subscribers

use std::fmt;

/// Kind of change carried by one event
///
/// A record that signals several changes keeps only the first match in the
/// order Modified, Created, Deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// None of the watched flags were set
    Unknown,
    /// Entry was created
    Created,
    /// Entry was deleted
    Deleted,
    /// Entry contents were modified
    Modified,
}

impl EventKind {
    fn verb(self) -> &'static str {
        match self {
            EventKind::Unknown => "changed",
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
            EventKind::Modified => "modified",
        }
    }
}

/// One change reported for an entry inside a watched directory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    name: String,
    is_dir: bool,
    kind: EventKind,
}

impl Event {
    /// Create a new event
    pub fn new(name: impl Into<String>, is_dir: bool, kind: EventKind) -> Self {
        Self {
            name: name.into(),
            is_dir,
            kind,
        }
    }

    /// Base name of the changed entry (not a full path)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the changed entry is a directory
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = if self.is_dir { "directory" } else { "file" };
        write!(f, "The {} {} was {}.", entry, self.name, self.kind.verb())
    }
}
