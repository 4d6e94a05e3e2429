//! Runtime attachment.
//!
//! A [`RuntimeBackend`] instruments a runtime module and forwards what it
//! observes into an [`EventSink`]. [`MonoRuntime`] hooks the legacy Mono
//! profiler API; [`ManualRuntime`] attaches to nothing and leaves it to the
//! caller to drive the sink.

use super::*;

use {
  crate::state::ProfilerInner,
  libloading::Library,
  std::{
    ffi::{CStr, c_char, c_int, c_uint, c_void},
    panic::{self, AssertUnwindSafe},
  },
};

/// Something that can attach the profiler to a managed runtime.
pub trait RuntimeBackend: Send + Sync + fmt::Debug {
  /// Short name used in logs.
  fn name(&self) -> &'static str;

  /// Instrument the runtime loaded from `module_path` so that its method
  /// and allocation events reach `sink`.
  ///
  /// # Errors
  ///
  /// Returns `HookError::AttachFailed` if the module cannot be located or
  /// does not expose the expected entry points.
  fn attach(
    &self,
    module_path: &Path,
    sink: EventSink,
  ) -> Result<HookHandle, HookError>;
}

/// Keeps an attachment alive; dropping it detaches the runtime.
pub struct HookHandle {
  detach: Option<Box<dyn FnOnce() + Send>>,
  module: PathBuf,
  runtime: &'static str,
}

impl HookHandle {
  #[must_use]
  pub fn new(runtime: &'static str, module: impl Into<PathBuf>) -> Self {
    Self {
      detach: None,
      module: module.into(),
      runtime,
    }
  }

  /// Run `detach` when the handle is dropped.
  #[must_use]
  pub fn on_detach(mut self, detach: impl FnOnce() + Send + 'static) -> Self {
    self.detach = Some(Box::new(detach));
    self
  }

  #[must_use]
  pub fn module(&self) -> &Path {
    &self.module
  }

  #[must_use]
  pub fn runtime(&self) -> &'static str {
    self.runtime
  }
}

impl fmt::Debug for HookHandle {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookHandle")
      .field("module", &self.module)
      .field("runtime", &self.runtime)
      .finish_non_exhaustive()
  }
}

impl Drop for HookHandle {
  fn drop(&mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

/// Hook-facing entry points into a profiler.
///
/// The sink holds a weak reference; once the profiler is gone every call is
/// a no-op.
#[derive(Clone, Debug)]
pub struct EventSink {
  inner: Weak<ProfilerInner>,
}

impl EventSink {
  pub(crate) fn new(inner: Weak<ProfilerInner>) -> Self {
    Self { inner }
  }

  /// Whether the profiler behind this sink still exists.
  #[must_use]
  pub fn is_connected(&self) -> bool {
    self.inner.strong_count() > 0
  }

  /// Whether allocations are currently being recorded.
  #[must_use]
  pub fn is_recording(&self) -> bool {
    self
      .inner
      .upgrade()
      .is_some_and(|inner| inner.is_recording())
  }

  /// The calling thread entered a managed method.
  pub fn method_enter(&self, frame: FrameMetadata) {
    if let Some(inner) = self.inner.upgrade() {
      inner.method_enter(frame);
    }
  }

  /// The calling thread left its innermost managed method.
  pub fn method_leave(&self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.method_leave();
    }
  }

  /// The calling thread allocated `size` bytes of `type_name`.
  pub fn allocation(&self, type_name: impl Into<Arc<str>>, size: u64) {
    self.record(AllocationEvent::new(type_name).size(size));
  }

  pub fn record(&self, event: AllocationEvent) {
    if let Some(inner) = self.inner.upgrade() {
      inner.record_allocation(&event);
    }
  }

  pub fn gc_event(&self, event: GcEvent, generation: i32) {
    trace!(?event, generation, "gc event");
  }

  pub fn heap_resized(&self, new_size: i64) {
    trace!(new_size, "gc heap resized");
  }

  /// The runtime is going away; stop recording.
  pub fn runtime_shutdown(&self) {
    info!("runtime shutting down");
    if let Some(inner) = self.inner.upgrade() {
      inner.stop_recording();
    }
  }
}

/// Backend that attaches to nothing. Events are fed through the sink, e.g.
/// from tests or from an embedder that already has its own hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualRuntime;

impl ManualRuntime {
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

impl RuntimeBackend for ManualRuntime {
  fn name(&self) -> &'static str {
    "manual"
  }

  fn attach(
    &self,
    module_path: &Path,
    _sink: EventSink,
  ) -> Result<HookHandle, HookError> {
    if module_path.as_os_str().is_empty() {
      return Err(HookError::attach_failed(
        module_path,
        "empty runtime module path",
      ));
    }

    Ok(HookHandle::new(self.name(), module_path))
  }
}

const MONO_PROFILE_ALLOCATIONS: c_int = 1 << 7;
const MONO_PROFILE_GC: c_int = 1 << 8;
const MONO_PROFILE_ENTER_LEAVE: c_int = 1 << 12;

type ProfileFunc = unsafe extern "C" fn(*mut c_void);
type MethodFunc = unsafe extern "C" fn(*mut c_void, *mut c_void);
type GcFunc = unsafe extern "C" fn(*mut c_void, c_int, c_int);
type GcResizeFunc = unsafe extern "C" fn(*mut c_void, i64);
type AllocFunc = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void);

type InstallFn = unsafe extern "C" fn(*mut c_void, Option<ProfileFunc>);
type InstallEnterLeaveFn =
  unsafe extern "C" fn(Option<MethodFunc>, Option<MethodFunc>);
type InstallGcFn = unsafe extern "C" fn(Option<GcFunc>, Option<GcResizeFunc>);
type InstallAllocationFn = unsafe extern "C" fn(Option<AllocFunc>);
type SetEventsFn = unsafe extern "C" fn(c_int);
type ObjectGetSizeFn = unsafe extern "C" fn(*mut c_void) -> c_uint;
type MethodGetNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type MethodGetClassFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ClassGetNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;

/// Accessors the callbacks need after installation.
struct MonoApi {
  class_get_name: ClassGetNameFn,
  method_get_class: MethodGetClassFn,
  method_get_name: MethodGetNameFn,
  object_get_size: ObjectGetSizeFn,
}

/// State reachable from the Mono callbacks through their `MonoProfiler*`
/// argument. Mono cannot uninstall a profiler, so this lives for the rest of
/// the process and is only unbound from the sink on detach.
struct MonoHookContext {
  api: MonoApi,
  classes: DashMap<usize, Arc<str>>,
  methods: DashMap<usize, FrameMetadata>,
  module: PathBuf,
  sink: RwLock<Option<EventSink>>,
  _library: Library,
}

static MONO_HOOK: Mutex<Option<&'static MonoHookContext>> = Mutex::new(None);

impl MonoHookContext {
  fn sink(&self) -> Option<EventSink> {
    match self.sink.read() {
      Ok(guard) => guard.clone(),
      Err(err) => err.into_inner().clone(),
    }
  }

  fn bind(&self, sink: Option<EventSink>) {
    match self.sink.write() {
      Ok(mut guard) => *guard = sink,
      Err(err) => *err.into_inner() = sink,
    }
  }

  /// # Safety
  ///
  /// `method` must be a live `MonoMethod*` handed out by the runtime.
  unsafe fn frame_for(&self, method: *mut c_void) -> FrameMetadata {
    let key = method as usize;
    if let Some(frame) = self.methods.get(&key) {
      return frame.clone();
    }

    let name = owned_c_str((self.api.method_get_name)(method));
    let class = self.class_name((self.api.method_get_class)(method));
    let frame = FrameMetadata {
      class,
      method: Arc::from(name),
    };

    self.methods.insert(key, frame.clone());
    frame
  }

  /// # Safety
  ///
  /// `klass` must be null or a live `MonoClass*`.
  unsafe fn class_name(&self, klass: *mut c_void) -> Arc<str> {
    if klass.is_null() {
      return Arc::from("<unknown>");
    }

    let key = klass as usize;
    if let Some(name) = self.classes.get(&key) {
      return Arc::clone(&name);
    }

    let name: Arc<str> =
      Arc::from(owned_c_str((self.api.class_get_name)(klass)));
    self.classes.insert(key, Arc::clone(&name));
    name
  }
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn owned_c_str(ptr: *const c_char) -> String {
  if ptr.is_null() {
    "<unknown>".to_string()
  } else {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
  }
}

/// Run a callback body without letting a panic unwind into the runtime.
fn guarded(prof: *mut c_void, body: impl FnOnce(&MonoHookContext)) {
  // SAFETY: `prof` is the context pointer registered through
  // `mono_profiler_install`, which is leaked and never freed.
  let Some(context) = (unsafe { (prof as *const MonoHookContext).as_ref() })
  else {
    return;
  };

  if panic::catch_unwind(AssertUnwindSafe(|| body(context))).is_err() {
    warn!("panic inside mono profiler callback suppressed");
  }
}

unsafe extern "C" fn on_shutdown(prof: *mut c_void) {
  guarded(prof, |context| {
    if let Some(sink) = context.sink() {
      sink.runtime_shutdown();
    }
  });
}

unsafe extern "C" fn on_gc_event(
  prof: *mut c_void,
  event: c_int,
  generation: c_int,
) {
  guarded(prof, |context| {
    if let Some(sink) = context.sink() {
      sink.gc_event(GcEvent::from_raw(event), generation);
    }
  });
}

unsafe extern "C" fn on_gc_resize(prof: *mut c_void, new_size: i64) {
  guarded(prof, |context| {
    if let Some(sink) = context.sink() {
      sink.heap_resized(new_size);
    }
  });
}

unsafe extern "C" fn on_method_enter(prof: *mut c_void, method: *mut c_void) {
  guarded(prof, |context| {
    if let Some(sink) = context.sink() {
      // SAFETY: the runtime passes the method being entered.
      sink.method_enter(unsafe { context.frame_for(method) });
    }
  });
}

unsafe extern "C" fn on_method_leave(prof: *mut c_void, _method: *mut c_void) {
  guarded(prof, |context| {
    if let Some(sink) = context.sink() {
      sink.method_leave();
    }
  });
}

unsafe extern "C" fn on_allocation(
  prof: *mut c_void,
  object: *mut c_void,
  klass: *mut c_void,
) {
  guarded(prof, |context| {
    let Some(sink) = context.sink() else {
      return;
    };

    if !sink.is_recording() {
      return;
    }

    // SAFETY: the runtime passes the freshly allocated object and its class.
    let (size, type_name) = unsafe {
      (
        u64::from((context.api.object_get_size)(object)),
        context.class_name(klass),
      )
    };

    sink.record(AllocationEvent::new(type_name).size(size));
  });
}

/// Hooks the legacy Mono profiler API (`mono_profiler_install` and friends)
/// exported by the runtime's shared library.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonoRuntime;

impl MonoRuntime {
  #[must_use]
  pub fn new() -> Self {
    Self
  }

  /// Load the module, resolve the profiler API and install the callbacks.
  fn install(
    module_path: &Path,
  ) -> Result<&'static MonoHookContext, HookError> {
    let fail = |reason: String| HookError::attach_failed(module_path, reason);

    // SAFETY: loading the runtime module runs its initializers; the caller
    // asked for exactly this module to be instrumented.
    let library = unsafe { Library::new(module_path) }
      .map_err(|err| fail(format!("cannot load module: {err}")))?;

    let install: InstallFn =
      resolve(&library, "mono_profiler_install").map_err(fail)?;
    let install_enter_leave: InstallEnterLeaveFn =
      resolve(&library, "mono_profiler_install_enter_leave").map_err(fail)?;
    let install_gc: InstallGcFn =
      resolve(&library, "mono_profiler_install_gc").map_err(fail)?;
    let install_allocation: InstallAllocationFn =
      resolve(&library, "mono_profiler_install_allocation").map_err(fail)?;
    let set_events: SetEventsFn =
      resolve(&library, "mono_profiler_set_events").map_err(fail)?;

    let api = MonoApi {
      class_get_name: resolve(&library, "mono_class_get_name").map_err(fail)?,
      method_get_class: resolve(&library, "mono_method_get_class")
        .map_err(fail)?,
      method_get_name: resolve(&library, "mono_method_get_name")
        .map_err(fail)?,
      object_get_size: resolve(&library, "mono_object_get_size")
        .map_err(fail)?,
    };

    let context: &'static MonoHookContext =
      Box::leak(Box::new(MonoHookContext {
        api,
        classes: DashMap::new(),
        methods: DashMap::new(),
        module: module_path.to_path_buf(),
        sink: RwLock::new(None),
        _library: library,
      }));

    let prof = context as *const MonoHookContext as *mut c_void;

    // SAFETY: every pointer was resolved from the loaded runtime with the
    // signature of the legacy profiler API, and `prof` outlives the runtime.
    unsafe {
      install(prof, Some(on_shutdown));
      install_gc(Some(on_gc_event), Some(on_gc_resize));
      install_enter_leave(Some(on_method_enter), Some(on_method_leave));
      install_allocation(Some(on_allocation));
      set_events(
        MONO_PROFILE_ALLOCATIONS | MONO_PROFILE_GC | MONO_PROFILE_ENTER_LEAVE,
      );
    }

    Ok(context)
  }
}

fn resolve<T: Copy>(library: &Library, symbol: &str) -> Result<T, String> {
  // SAFETY: `T` is the documented signature of `symbol` in the Mono API.
  unsafe { library.get::<T>(symbol.as_bytes()) }
    .map(|found| *found)
    .map_err(|err| format!("missing symbol {symbol}: {err}"))
}

impl RuntimeBackend for MonoRuntime {
  fn name(&self) -> &'static str {
    "mono"
  }

  fn attach(
    &self,
    module_path: &Path,
    sink: EventSink,
  ) -> Result<HookHandle, HookError> {
    let mut installed = match MONO_HOOK.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    };

    let current = *installed;
    let context = match current {
      Some(context) if context.module != module_path => {
        return Err(HookError::attach_failed(
          module_path,
          format!(
            "runtime already hooked through {}",
            context.module.display()
          ),
        ));
      }
      Some(context) => {
        if context.sink().is_some_and(|bound| bound.is_connected()) {
          return Err(HookError::attach_failed(
            module_path,
            "runtime is already profiled by another session",
          ));
        }
        debug!(module = %module_path.display(), "rebinding mono hook");
        context
      }
      None => {
        let context = Self::install(module_path)?;
        *installed = Some(context);
        context
      }
    };

    context.bind(Some(sink));

    Ok(
      HookHandle::new(self.name(), module_path)
        .on_detach(move || context.bind(None)),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_runtime_rejects_empty_path() {
    let profiler = Profiler::builder().backend(ManualRuntime::new()).finish();
    assert!(matches!(
      profiler.init(""),
      Err(HookError::AttachFailed { .. })
    ));
    assert!(!profiler.is_initialized());
  }

  #[test]
  fn mono_runtime_fails_on_missing_module() {
    let profiler = Profiler::builder().backend(MonoRuntime::new()).finish();
    let err = profiler
      .init("/nonexistent/path/to/libmono-2.0.so")
      .expect_err("module does not exist");

    match err {
      HookError::AttachFailed { module, reason } => {
        assert!(module.ends_with("libmono-2.0.so"));
        assert!(reason.starts_with("cannot load module"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn mono_runtime_fails_on_module_without_profiler_api() {
    let profiler = Profiler::builder().backend(MonoRuntime::new()).finish();
    let err = profiler.init("libc.so.6").expect_err("libc is not mono");

    match err {
      HookError::AttachFailed { reason, .. } => {
        assert!(reason.contains("mono_profiler_install"), "{reason}");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn dropping_the_handle_runs_detach() {
    let detached = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&detached);

    let handle = HookHandle::new("manual", "mono")
      .on_detach(move || flag.store(true, Ordering::SeqCst));
    assert_eq!(handle.runtime(), "manual");
    drop(handle);

    assert!(detached.load(Ordering::SeqCst));
  }

  #[test]
  fn sink_outliving_profiler_is_inert() {
    let profiler = Profiler::builder().backend(ManualRuntime::new()).finish();
    let sink = profiler.sink();
    assert!(sink.is_connected());

    drop(profiler);
    assert!(!sink.is_connected());
    assert!(!sink.is_recording());
    sink.method_enter(FrameMetadata::new("A", "Run"));
    sink.allocation("Foo", 1);
    sink.method_leave();
  }

  #[test]
  fn runtime_shutdown_stops_recording() {
    let profiler = Profiler::builder().backend(ManualRuntime::new()).finish();
    profiler.init("mono").expect("attach");
    profiler.resume().expect("resume");

    profiler.sink().runtime_shutdown();
    assert!(!profiler.is_recording());
  }
}
