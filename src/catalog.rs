//! Query catalog: the immutable set of definitions a run draws from.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BenchError, BenchResult};
use crate::model::QueryDefinition;
use crate::parser::{self, UploadPolicy};

/// Ordered collection of uniquely named query definitions.
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    queries: Vec<Arc<QueryDefinition>>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from predefined definitions.
    ///
    /// Invalid or duplicate definitions are returned as rejections; the
    /// valid ones are kept.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = QueryDefinition>,
    ) -> (Self, Vec<BenchError>) {
        let mut catalog = Self::new();
        let mut rejected = Vec::new();
        for def in definitions {
            if let Err(e) = catalog.insert(def) {
                rejected.push(e);
            }
        }
        (catalog, rejected)
    }

    /// Add a definition after validating it.
    pub fn insert(&mut self, def: QueryDefinition) -> BenchResult<()> {
        parser::validate_definition(&def)?;
        if self.get(&def.identifier).is_some() {
            return Err(BenchError::validation(
                &def.identifier,
                "query identifier is not unique",
            ));
        }
        debug!(
            "Catalog: added '{}' ({} parameter set(s), repeat {})",
            def.identifier,
            def.parameter_sets.len(),
            def.repeat_count
        );
        self.queries.push(Arc::new(def));
        Ok(())
    }

    /// Parse and add uploaded artifacts. Returns the rejected uploads.
    pub fn load_uploads<'a>(
        &mut self,
        uploads: impl IntoIterator<Item = (&'a str, &'a [u8])>,
        policy: &UploadPolicy,
    ) -> Vec<BenchError> {
        let mut rejected = Vec::new();
        for (name, content) in uploads {
            let outcome =
                parser::parse_upload(name, content, policy).and_then(|def| self.insert(def));
            if let Err(e) = outcome {
                warn!("Rejected query source: {}", e);
                rejected.push(e);
            }
        }
        rejected
    }

    /// Load a single file, or every file of a directory, as uploads.
    ///
    /// Directory entries are read in name order so that runs are repeatable.
    pub fn load_path(&mut self, path: &Path, policy: &UploadPolicy) -> BenchResult<Vec<BenchError>> {
        let mut files = Vec::new();
        if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
        } else {
            files.push(path.to_path_buf());
        }

        let mut loaded = Vec::new();
        let mut rejected = Vec::new();
        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            // Size is checked before the content is read.
            let len = fs::metadata(&file)?.len() as usize;
            match policy.check(&name, len) {
                Ok(()) => loaded.push((name, fs::read(&file)?)),
                Err(e) => rejected.push(e),
            }
        }
        rejected.extend(
            self.load_uploads(loaded.iter().map(|(n, c)| (n.as_str(), c.as_slice())), policy),
        );
        Ok(rejected)
    }

    pub fn get(&self, identifier: &str) -> Option<&Arc<QueryDefinition>> {
        self.queries.iter().find(|q| q.identifier == identifier)
    }

    pub fn queries(&self) -> &[Arc<QueryDefinition>] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
