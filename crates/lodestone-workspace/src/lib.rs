//! Per-profile workspace materialization for Lodestone
//!
//! A workspace is a directory tree assembled from delivered manifests whose
//! files live in a [`lodestone_cas::ContentStore`]. Depending on the
//! [`WorkspaceStrategy`], each file is copied, hard linked or symlinked out of
//! the store. When the platform refuses a link for lack of privilege the file
//! is copied instead and a warning is reported.
//!
//! # Example
//!
//! ```no_run
//! use lodestone_cas::{CasConfig, ContentStore};
//! use lodestone_content::OperationContext;
//! use lodestone_workspace::{PrepareRequest, WorkspaceConfig, WorkspaceManager, WorkspaceStrategy};
//! use std::sync::Arc;
//!
//! # async fn example(manifests: Vec<lodestone_content::ContentManifest>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(ContentStore::open(CasConfig::new("./data/cas"))?);
//! let manager = WorkspaceManager::new(WorkspaceConfig::new("./workspaces"), store)?;
//!
//! let request = PrepareRequest::new("default", manifests)
//!     .with_strategy(WorkspaceStrategy::HybridCopySymlink);
//! let result = manager.prepare(request, &OperationContext::new()).await?;
//! for warning in &result.warnings {
//!     eprintln!("{warning}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod fileops;
pub mod strategy;

pub use config::WorkspaceConfig;
pub use engine::{
    PrepareRequest, RECORD_FILE_NAME, WorkspaceFile, WorkspaceManager, WorkspaceRecord,
    WorkspaceResult, WorkspaceState,
};
pub use error::{Result, WorkspaceError};
pub use fileops::{FileOperations, FileOutcome, FileSystem, RealFileSystem};
pub use strategy::{FileOp, OpPlan, WorkspaceStrategy, plan_for};
