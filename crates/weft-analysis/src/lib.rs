use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

mod edges;
mod extract;
mod grouping;
mod query;

pub use edges::build_edges;
pub use extract::{CommitChanges, ExtractOutcome, extract};
pub use grouping::{Transaction, group_changesets};
pub use query::{
    ComponentEdge, CouplingGraph, CouplingNeighbor, Hotspot, HotspotSort, aggregate_components,
    coupling_for_file, coupling_graph, hotspots,
};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] weft_core::CoreError),
    #[error("git error: {0}")]
    Git(#[from] weft_git::GitError),
    #[error("store error: {0}")]
    Store(#[from] weft_store::StoreError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unknown file '{0}'")]
    UnknownFile(String),
    #[error("canceled")]
    Canceled,
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), AnalysisError> {
        if self.is_canceled() {
            return Err(AnalysisError::Canceled);
        }
        Ok(())
    }
}
