use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures of the runtime hook and of the session lifecycle.
#[derive(Debug, Error)]
pub enum HookError {
  /// The session is already attached to a runtime.
  #[error("profiler is already initialized")]
  AlreadyInitialized,

  /// The runtime module could not be located or instrumented.
  #[error("failed to attach to runtime module {}: {reason}", module.display())]
  AttachFailed {
    /// Module path passed to `init`.
    module: PathBuf,
    /// What went wrong while loading or instrumenting it.
    reason: String,
  },

  /// The operation needs an initialized session.
  #[error("profiler is not initialized")]
  NotInitialized,
}

impl HookError {
  pub(crate) fn attach_failed(
    module: impl Into<PathBuf>,
    reason: impl Into<String>,
  ) -> Self {
    Self::AttachFailed {
      module: module.into(),
      reason: reason.into(),
    }
  }
}

/// Query made through a cursor that has no current record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum IterationError {
  #[error("no current record under the cursor")]
  NoCurrent,
}

/// Errors that can occur while dumping or streaming snapshots.
#[derive(Debug, Error)]
pub enum DumpError {
  #[error("i/o error while writing dump to {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("i/o error during export: {0}")]
  Stream(#[from] io::Error),

  #[error("failed to encode snapshot as json: {0}")]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Hook(#[from] HookError),
}
