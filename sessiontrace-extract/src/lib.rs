//! Hierarchical extraction of session traces into columnar files.

pub mod metadata;
pub mod orchestrator;
pub mod queries;

pub use metadata::{read_metadata, write_metadata, RunMetadata, RunParameters, METADATA_FILE};
pub use orchestrator::{ExtractOptions, ExtractionMode, ExtractionOrchestrator, ExtractionResult};
