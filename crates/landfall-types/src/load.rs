//! Load batch file naming and lineage references.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{DestinationError, Result};

/// Extension of lineage reference files.
pub const REFERENCE_EXTENSION: &str = "reference";

/// Format of the file listing the tables whose staging copies replace them.
pub const STAGING_SWAP_EXTENSION: &str = "swap";

/// Components of a batch file name: `<table>.<file_id>.<retry_count>.<format>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLoadJobFileName {
    pub table_name: String,
    pub file_id: String,
    pub retry_count: u32,
    pub file_format: String,
}

impl ParsedLoadJobFileName {
    /// Parse the file name component of `path`.
    ///
    /// # Errors
    ///
    /// Returns a `config` error when the name does not have four dot-separated
    /// parts or the retry count is not numeric.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid_name(path))?;
        let parts: Vec<&str> = file_name.split('.').collect();
        let [table_name, file_id, retry_count, file_format] = parts.as_slice() else {
            return Err(invalid_name(path));
        };
        if table_name.is_empty() || file_id.is_empty() {
            return Err(invalid_name(path));
        }
        let retry_count = retry_count.parse().map_err(|_| invalid_name(path))?;
        Ok(Self {
            table_name: (*table_name).to_string(),
            file_id: (*file_id).to_string(),
            retry_count,
            file_format: (*file_format).to_string(),
        })
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.file_format == REFERENCE_EXTENSION
    }

    #[must_use]
    pub fn is_staging_swap(&self) -> bool {
        self.file_format == STAGING_SWAP_EXTENSION
    }

    /// Same job with a different format, e.g. the reference file for a root batch.
    #[must_use]
    pub fn with_format(&self, format: &str) -> Self {
        Self {
            file_format: format.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ParsedLoadJobFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.table_name, self.file_id, self.retry_count, self.file_format
        )
    }
}

fn invalid_name(path: &Path) -> DestinationError {
    DestinationError::config(
        "INVALID_JOB_FILE_NAME",
        format!(
            "'{}' is not of the form <table>.<file_id>.<retry_count>.<format>",
            path.display()
        ),
    )
    .with_file(&path.display().to_string())
}

/// Ordered batch paths of one root-plus-children write group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageReference {
    pub paths: Vec<PathBuf>,
}

impl LineageReference {
    #[must_use]
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// Parse newline-separated paths, ignoring blank lines.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let paths = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();
        Self { paths }
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for path in &self.paths {
            out.push_str(&path.display().to_string());
            out.push('\n');
        }
        out
    }

    /// Pair each path with its parsed table name, preserving order.
    ///
    /// # Errors
    ///
    /// Fails on the first path that is not a valid job file name.
    pub fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        self.paths
            .iter()
            .map(|p| Ok((ParsedLoadJobFileName::parse(p)?.table_name, p.clone())))
            .collect()
    }
}
