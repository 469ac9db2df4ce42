//! Document store implementations and store-level configuration.

use serde::Deserialize;

use crate::metadata::DEFAULT_SEPARATOR;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockDocumentStore;

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Separator between table name and entity id in document ids.
    pub separator: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}
