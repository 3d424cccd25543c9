//! Units of work and results for the migration pipeline.

/// A single object path queued for migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationJob {
    pub path: String,

    /// Zero-based position in the originating job list.
    pub ordinal: u64,
}

impl MigrationJob {
    pub fn new(path: impl Into<String>, ordinal: u64) -> Self {
        Self {
            path: path.into(),
            ordinal,
        }
    }
}

/// The terminal result of one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub success: bool,
    pub path: String,
    pub error: Option<String>,
}

impl MigrationOutcome {
    pub fn succeeded(path: String) -> Self {
        Self {
            success: true,
            path,
            error: None,
        }
    }

    pub fn failed(path: String, error: String) -> Self {
        Self {
            success: false,
            path,
            error: Some(error),
        }
    }

    /// The line written to the failure log: `<path> : <error>`.
    pub fn failure_line(&self) -> Option<String> {
        self.error
            .as_ref()
            .map(|error| format!("{} : {}", self.path, error))
    }
}
