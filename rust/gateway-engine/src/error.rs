use std::fmt;
use std::io;
use std::path::PathBuf;

use gateway_shm::LayoutError;

/// The engine could not bring up its shared-memory layouts.
#[derive(Debug)]
pub enum EngineError {
    /// [`EngineConfig::validate`](crate::EngineConfig::validate) rejected the configuration.
    Config(&'static str),
    /// A per-worker file could not be created or attached.
    Layout { path: PathBuf, source: LayoutError },
    /// The label table could not be read or extended.
    Labels { path: PathBuf, source: io::Error },
}

impl EngineError {
    pub(crate) fn layout(path: impl Into<PathBuf>) -> impl FnOnce(LayoutError) -> Self {
        let path = path.into();
        move |source| Self::Layout { path, source }
    }

    pub(crate) fn labels(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Labels { path, source }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid engine config: {msg}"),
            Self::Layout { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Labels { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(_) => None,
            Self::Layout { source, .. } => Some(source),
            Self::Labels { source, .. } => Some(source),
        }
    }
}
