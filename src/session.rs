//! Process-wide flat interface for single-cursor consumers such as an editor
//! window.
//!
//! One session exists per process between [`init`] and [`shutdown`]. It owns
//! one method cursor and one object cursor; starting a method iteration
//! takes a fresh snapshot and invalidates whatever was being iterated
//! before. Getters return owned copies and fall back to empty values when no
//! record is current.

use super::*;

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

struct Session {
  profiler: Profiler,
  view: Option<View>,
}

/// Frozen snapshot plus the positions of the two shared cursors.
struct View {
  method: usize,
  object: Option<usize>,
  snapshot: Snapshot,
}

impl View {
  fn current_method(&self) -> Result<&MethodRecord, IterationError> {
    self
      .snapshot
      .records()
      .get(self.method)
      .ok_or(IterationError::NoCurrent)
  }

  fn current_object(&self) -> Result<&TypeRecord, IterationError> {
    let object = self.object.ok_or(IterationError::NoCurrent)?;
    self
      .current_method()?
      .types
      .get(object)
      .ok_or(IterationError::NoCurrent)
  }
}

fn lock_session() -> MutexGuard<'static, Option<Session>> {
  match SESSION.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn with_profiler<R>(
  f: impl FnOnce(&Profiler) -> Result<R, HookError>,
) -> Result<R, HookError> {
  let guard = lock_session();
  let session = guard.as_ref().ok_or(HookError::NotInitialized)?;
  f(&session.profiler)
}

fn with_view<R>(
  f: impl FnOnce(&View) -> Result<R, IterationError>,
) -> Option<R> {
  let guard = lock_session();
  let view = guard.as_ref()?.view.as_ref()?;
  f(view).ok()
}

fn log_ignored(operation: &str, result: Result<(), HookError>) {
  if let Err(err) = result {
    debug!(operation, error = %err, "session call ignored");
  }
}

/// Attach a Mono profiler configured from the environment to the runtime at
/// `path`. A second `init` in the same session is ignored.
///
/// # Errors
///
/// Returns `HookError::AttachFailed` when the runtime cannot be hooked.
pub fn init(path: impl AsRef<Path>) -> Result<(), HookError> {
  let profiler = Profiler::builder()
    .with_config(ProfilerConfig::from_env())
    .backend(MonoRuntime::new())
    .finish();
  init_with(profiler, path)
}

/// Install `profiler` as the process-wide session and attach it to `path`.
///
/// # Errors
///
/// Returns `HookError::AttachFailed` when the runtime cannot be hooked.
pub fn init_with(
  profiler: Profiler,
  path: impl AsRef<Path>,
) -> Result<(), HookError> {
  let mut guard = lock_session();

  if guard.is_some() {
    debug!("session already initialized, ignoring init");
    return Ok(());
  }

  match profiler.init(path) {
    Ok(()) | Err(HookError::AlreadyInitialized) => {}
    Err(err) => return Err(err),
  }

  *guard = Some(Session {
    profiler,
    view: None,
  });
  Ok(())
}

/// Detach and drop the session. Later calls behave as uninitialized until
/// the next `init`.
pub fn shutdown() {
  let Some(session) = lock_session().take() else {
    return;
  };
  log_ignored("shutdown", session.profiler.shutdown());
}

#[must_use]
pub fn is_initialized() -> bool {
  lock_session().is_some()
}

/// The sink feeding the current session, if any.
#[must_use]
pub fn sink() -> Option<EventSink> {
  lock_session()
    .as_ref()
    .map(|session| session.profiler.sink())
}

pub fn pause() {
  log_ignored("pause", with_profiler(Profiler::pause));
}

pub fn resume() {
  log_ignored("resume", with_profiler(Profiler::resume));
}

/// Drop all records. An active iteration keeps reading its own snapshot.
pub fn clear() {
  log_ignored("clear", with_profiler(Profiler::clear));
}

/// Dump the current state to `path`.
///
/// # Errors
///
/// Returns `DumpError::Hook` outside a session and `DumpError::Io` when the
/// file cannot be written.
pub fn dump(path: impl AsRef<Path>, details: bool) -> Result<(), DumpError> {
  let profiler = {
    let guard = lock_session();
    let session = guard.as_ref().ok_or(HookError::NotInitialized)?;
    session.profiler.clone()
  };
  profiler.dump(path, details)
}

/// Pause the profiler and start iterating a fresh snapshot from its first
/// method. Any previous iteration is discarded.
pub fn begin_method_iterator() {
  let mut guard = lock_session();
  let Some(session) = guard.as_mut() else {
    return;
  };

  let snapshot = session
    .profiler
    .pause()
    .and_then(|()| session.profiler.snapshot());

  match snapshot {
    Ok(snapshot) => {
      session.view = Some(View {
        method: 0,
        object: None,
        snapshot,
      });
    }
    Err(err) => {
      debug!(error = %err, "cannot begin method iteration");
      session.view = None;
    }
  }
}

/// Advance to the next method. Returns `false` once past the last one.
/// The object cursor of the previous method is discarded.
pub fn next_method_iterator() -> bool {
  let mut guard = lock_session();
  let Some(view) = guard.as_mut().and_then(|session| session.view.as_mut())
  else {
    return false;
  };

  let len = view.snapshot.len();
  if view.method < len {
    view.method += 1;
  }
  view.object = None;
  view.method < len
}

pub fn end_method_iterator() {
  if let Some(session) = lock_session().as_mut() {
    session.view = None;
  }
}

#[must_use]
pub fn get_method_name() -> String {
  with_view(|view| view.current_method().map(|m| m.name.to_string()))
    .unwrap_or_default()
}

#[must_use]
pub fn get_method_call_stack() -> String {
  with_view(|view| view.current_method().map(|m| m.stack.to_string()))
    .unwrap_or_default()
}

#[must_use]
pub fn get_method_alloc_size() -> u64 {
  with_view(|view| view.current_method().map(|m| m.total_bytes))
    .unwrap_or_default()
}

#[must_use]
pub fn get_method_alloc_size_delta() -> u64 {
  with_view(|view| view.current_method().map(|m| m.delta_bytes))
    .unwrap_or_default()
}

/// Start iterating the types of the current method.
pub fn begin_object_iterator() {
  let mut guard = lock_session();
  let Some(view) = guard.as_mut().and_then(|session| session.view.as_mut())
  else {
    return;
  };

  view.object = view.current_method().ok().map(|_| 0);
}

/// Advance to the next type of the current method.
pub fn next_object_iterator() -> bool {
  let mut guard = lock_session();
  let Some(view) = guard.as_mut().and_then(|session| session.view.as_mut())
  else {
    return false;
  };

  let Ok(len) = view.current_method().map(|m| m.types.len()) else {
    return false;
  };
  let Some(object) = view.object.as_mut() else {
    return false;
  };

  if *object < len {
    *object += 1;
  }
  *object < len
}

pub fn end_object_iterator() {
  if let Some(view) = lock_session()
    .as_mut()
    .and_then(|session| session.view.as_mut())
  {
    view.object = None;
  }
}

#[must_use]
pub fn get_object_name() -> String {
  with_view(|view| view.current_object().map(|ty| ty.name.to_string()))
    .unwrap_or_default()
}

#[must_use]
pub fn get_object_alloc_size() -> u64 {
  with_view(|view| view.current_object().map(|ty| ty.bytes))
    .unwrap_or_default()
}
