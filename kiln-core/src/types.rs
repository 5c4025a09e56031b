//! Domain types shared between the proxy core and its consumers.
//!
//! The wire vocabulary is closed: parsers return `None` for strings outside
//! it so callers can log and keep their previous value. The `Unknown` /
//! `Invalid` variants exist as initial values and parse-failure sentinels
//! only and are never produced by `from_wire`.

use std::fmt;

/// Lifecycle state reported by a build node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Building,
    Finished,
    Failed,
    Maintenance,
    /// No status message seen yet, or only unparsable ones.
    Unknown,
}

impl NodeState {
    /// Parse a wire state string. Strings outside the closed vocabulary
    /// yield `None`.
    pub fn from_wire(s: &str) -> Option<NodeState> {
        match s {
            "idle" => Some(NodeState::Idle),
            "building" => Some(NodeState::Building),
            "finished" => Some(NodeState::Finished),
            "failed" => Some(NodeState::Failed),
            "maintenance" => Some(NodeState::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Idle => "idle",
            NodeState::Building => "building",
            NodeState::Finished => "finished",
            NodeState::Failed => "failed",
            NodeState::Maintenance => "maintenance",
            NodeState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordination state reported by a build master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterState {
    Off,
    Idle,
    Computing,
    Building,
    /// Parse-failure sentinel, never stored.
    Invalid,
}

impl MasterState {
    pub fn from_wire(s: &str) -> Option<MasterState> {
        match s {
            "off" => Some(MasterState::Off),
            "idle" => Some(MasterState::Idle),
            "computing" => Some(MasterState::Computing),
            "building" => Some(MasterState::Building),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MasterState::Off => "off",
            MasterState::Idle => "idle",
            MasterState::Computing => "computing",
            MasterState::Building => "building",
            MasterState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target architecture selected on a build master.
///
/// Build node status messages reuse the same strings for the architecture
/// of the package being built, but the node side keeps them opaque; only
/// masters store a parsed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    I386,
    Amd64,
    /// Parse-failure sentinel, rejected by commands.
    Invalid,
}

impl Architecture {
    pub fn from_wire(s: &str) -> Option<Architecture> {
        match s {
            "i386" => Some(Architecture::I386),
            "amd64" => Some(Architecture::Amd64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::I386 => "i386",
            Architecture::Amd64 => "amd64",
            Architecture::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(name, version)` package coordinate as tracked by build masters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Package {
    pub name: String,
    pub version: String,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}
