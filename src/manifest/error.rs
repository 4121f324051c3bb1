//! Manifest codec errors

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ManifestError {
    /// The manifest directory does not exist
    NotFound(PathBuf),
    /// Reading or writing a manifest file failed
    Io { path: PathBuf, source: std::io::Error },
    /// `metadata.json` is not valid
    MalformedMetadata { path: PathBuf, reason: String },
    /// A migration file name or body could not be parsed
    InvalidMigration { path: PathBuf, reason: String },
    /// Validation failed; one entry per problem
    Invalid(Vec<String>),
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ManifestError::Io { path, source }
    }

    /// Validation problems, empty for other errors.
    pub fn problems(&self) -> &[String] {
        match self {
            ManifestError::Invalid(problems) => problems,
            _ => &[],
        }
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::NotFound(path) => write!(f, "Manifest directory does not exist: {}", path.display()),
            ManifestError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            ManifestError::MalformedMetadata { path, reason } => {
                write!(f, "Malformed manifest metadata in {}: {}", path.display(), reason)
            }
            ManifestError::InvalidMigration { path, reason } => {
                write!(f, "Invalid migration file {}: {}", path.display(), reason)
            }
            ManifestError::Invalid(problems) => {
                write!(f, "Manifest validation failed:")?;
                for problem in problems {
                    write!(f, "\n  - {}", problem)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
