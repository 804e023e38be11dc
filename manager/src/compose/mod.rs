//! Compose document engine: parsing, substitution, transforms, generation

pub mod document;
pub mod generate;
pub mod schema;
pub mod transform;
pub mod variables;

pub use document::{find_compose_file, ComposeDocument, DEFAULT_COMPOSE_FILES, METADATA_KEY};
pub use transform::{apply_all, TransformContext, TransformReport};
