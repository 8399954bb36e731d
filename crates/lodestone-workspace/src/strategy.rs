//! Workspace strategies and the per-file operation table
//!
//! The table is pure data so the fallback policy can be tested without a
//! filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WorkspaceError;

/// How files reach a workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    /// Independent copy of every file
    FullCopy,
    /// Hard link every immutable file into the store
    HardLink,
    /// Symlink every file into the store
    SymlinkOnly,
    /// Symlink shared assets, copy saves and settings
    #[default]
    HybridCopySymlink,
}

impl WorkspaceStrategy {
    /// Every strategy, in display order
    pub const ALL: [Self; 4] = [
        Self::FullCopy,
        Self::HardLink,
        Self::SymlinkOnly,
        Self::HybridCopySymlink,
    ];

    /// Stable snake_case name
    pub const fn name(self) -> &'static str {
        match self {
            Self::FullCopy => "full_copy",
            Self::HardLink => "hard_link",
            Self::SymlinkOnly => "symlink_only",
            Self::HybridCopySymlink => "hybrid_copy_symlink",
        }
    }
}

impl fmt::Display for WorkspaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkspaceStrategy {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "full_copy" | "copy" => Ok(Self::FullCopy),
            "hard_link" | "hardlink" => Ok(Self::HardLink),
            "symlink_only" | "symlink" => Ok(Self::SymlinkOnly),
            "hybrid_copy_symlink" | "hybrid" => Ok(Self::HybridCopySymlink),
            _ => Err(WorkspaceError::Config(format!("unknown workspace strategy '{s}'"))),
        }
    }
}

/// Filesystem primitive used for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    /// Independent copy
    Copy,
    /// Hard link to the store object
    HardLink,
    /// Symlink to the store object
    Symlink,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Copy => "copy",
            Self::HardLink => "hard link",
            Self::Symlink => "symlink",
        })
    }
}

/// Primary operation and what to try if the platform refuses it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPlan {
    /// Operation tried first
    pub primary: FileOp,
    /// Operation tried when the platform refuses the primary
    pub fallback: Option<FileOp>,
}

impl OpPlan {
    const fn only(op: FileOp) -> Self {
        Self {
            primary: op,
            fallback: None,
        }
    }

    const fn or_copy(op: FileOp) -> Self {
        Self {
            primary: op,
            fallback: Some(FileOp::Copy),
        }
    }
}

/// Decide how a file is materialized under `strategy`
///
/// Mutable files are never hard linked: a write through the link would
/// change the shared store object.
pub const fn plan_for(strategy: WorkspaceStrategy, mutable: bool) -> OpPlan {
    match (strategy, mutable) {
        (WorkspaceStrategy::FullCopy, _)
        | (WorkspaceStrategy::HardLink | WorkspaceStrategy::HybridCopySymlink, true) => {
            OpPlan::only(FileOp::Copy)
        }
        (WorkspaceStrategy::HardLink, false) => OpPlan::or_copy(FileOp::HardLink),
        (WorkspaceStrategy::SymlinkOnly, _) | (WorkspaceStrategy::HybridCopySymlink, false) => {
            OpPlan::or_copy(FileOp::Symlink)
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        use FileOp::{Copy, HardLink, Symlink};
        let cases = [
            (WorkspaceStrategy::FullCopy, false, Copy, None),
            (WorkspaceStrategy::FullCopy, true, Copy, None),
            (WorkspaceStrategy::HardLink, false, HardLink, Some(Copy)),
            (WorkspaceStrategy::HardLink, true, Copy, None),
            (WorkspaceStrategy::SymlinkOnly, false, Symlink, Some(Copy)),
            (WorkspaceStrategy::SymlinkOnly, true, Symlink, Some(Copy)),
            (WorkspaceStrategy::HybridCopySymlink, false, Symlink, Some(Copy)),
            (WorkspaceStrategy::HybridCopySymlink, true, Copy, None),
        ];
        for (strategy, mutable, primary, fallback) in cases {
            let plan = plan_for(strategy, mutable);
            assert_eq!(plan.primary, primary, "{strategy} mutable={mutable}");
            assert_eq!(plan.fallback, fallback, "{strategy} mutable={mutable}");
        }
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in WorkspaceStrategy::ALL {
            assert_eq!(
                strategy.to_string().parse::<WorkspaceStrategy>().expect("parse"),
                strategy
            );
        }
        assert_eq!(
            "Hybrid".parse::<WorkspaceStrategy>().expect("alias"),
            WorkspaceStrategy::HybridCopySymlink
        );
        assert_eq!(
            "hard-link".parse::<WorkspaceStrategy>().expect("dash"),
            WorkspaceStrategy::HardLink
        );
        assert!("zip".parse::<WorkspaceStrategy>().is_err());
    }
}
