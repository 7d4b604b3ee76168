use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UbError {
    #[error("package \"{0}\" is not installed")]
    NotInstalled(String),

    #[error("formula \"{0}\" is not installed")]
    FormulaNotInstalled(String),

    #[error("cask \"{0}\" is not installed")]
    CaskNotInstalled(String),

    #[error("formula \"{0}\" has no installed versions")]
    NoInstalledVersions(String),

    #[error("cask \"{0}\" has no installed versions")]
    NoInstalledCaskVersions(String),

    #[error("install root is already locked: {}", .0.display())]
    AlreadyLocked(PathBuf),

    #[error("dependency cycle detected at \"{0}\"")]
    DependencyCycle(String),

    #[error("dependency graph contains a cycle")]
    PlanCycle,

    #[error("formula \"{parent}\" depends on unknown formula \"{child}\"")]
    UnknownDependency { parent: String, child: String },

    #[error("resolve dependency \"{child}\" for \"{parent}\": {source}")]
    DependencyResolution {
        parent: String,
        child: String,
        #[source]
        source: Box<UbError>,
    },

    #[error("formula \"{0}\" cannot depend on itself")]
    SelfDependency(String),

    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("download {url:?} failed after retries: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: Box<UbError>,
    },

    #[error("registry authentication required: {0}")]
    RegistryAuth(String),

    #[error("sha256 mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("archive entry escapes destination: {0:?}")]
    ArchiveEscape(String),

    #[error("formula \"{0}\" has no stable bottle")]
    NoStableBottle(String),

    #[error("cask \"{0}\" has no app artifact")]
    NoAppArtifact(String),

    #[error("could not find {name:?} in {}", .root.display())]
    AppBundleNotFound { name: String, root: PathBuf },

    #[error("duplicate job id \"{0}\"")]
    DuplicateJob(String),

    #[error("job \"{id}\" requires unknown job \"{requirement}\"")]
    UnknownJobRequirement { id: String, requirement: String },

    #[error("no initial runnable jobs; cycle likely present")]
    NoRunnableJobs,

    #[error("job \"{id}\" failed: {source}")]
    JobFailed {
        id: String,
        #[source]
        source: Box<UbError>,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("build step failed ({step}): exit status {status}")]
    BuildStepFailed { step: String, status: i32 },

    #[error("{0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl UbError {
    /// True when the error is an HTTP 404, including one buried under the
    /// after-retries wrapper. Used to dispatch formula-vs-cask lookups.
    pub fn is_not_found(&self) -> bool {
        match self {
            UbError::Status { status, .. } => *status == 404,
            UbError::DownloadFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for UbError {
    fn from(source: std::io::Error) -> Self {
        UbError::Io {
            context: "io error".to_string(),
            source,
        }
    }
}

/// Attach a human-readable context to an io::Error.
pub(crate) fn io_context(context: impl Into<String>, source: std::io::Error) -> UbError {
    UbError::Io {
        context: context.into(),
        source,
    }
}

pub type Result<T> = std::result::Result<T, UbError>;
