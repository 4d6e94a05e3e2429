use super::*;

static NEXT_PROFILER_ID: AtomicU64 = AtomicU64::new(1);

/// Thin builder that customizes `ProfilerConfig` and picks the runtime
/// backend.
#[derive(Debug, Default)]
pub struct ProfilerBuilder {
  backend: Option<Box<dyn RuntimeBackend>>,
  config: ProfilerConfig,
}

impl ProfilerBuilder {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn with_config(mut self, config: ProfilerConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn backend(mut self, backend: impl RuntimeBackend + 'static) -> Self {
    self.backend = Some(Box::new(backend));
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth.max(1);
    self
  }

  #[must_use]
  pub fn capture_native(mut self, capture: bool) -> Self {
    self.config.capture_native = capture;
    self
  }

  #[must_use]
  pub fn dump_format(mut self, format: DumpFormat) -> Self {
    self.config.dump_format = format;
    self
  }

  #[must_use]
  pub fn finish(self) -> Profiler {
    let backend = self
      .backend
      .unwrap_or_else(|| Box::new(MonoRuntime::new()));
    Profiler::with_backend(self.config, backend)
  }
}

#[derive(Debug)]
enum Phase {
  Uninitialized,
  Initialized { hook: HookHandle },
}

#[derive(Debug)]
pub(crate) struct ProfilerInner {
  aggregator: Aggregator,
  backend: Box<dyn RuntimeBackend>,
  capturer: StackCapturer,
  config: ProfilerConfig,
  /// Bumped on every resume; deltas from older epochs read as zero.
  epoch: AtomicU64,
  /// Recorders hold the read side, state transitions the write side.
  gate: RwLock<()>,
  id: u64,
  phase: Mutex<Phase>,
  recording: AtomicBool,
  sites: Arc<SiteTable>,
}

impl ProfilerInner {
  fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
    match self.gate.read() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
    match self.gate.write() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn lock_phase(&self) -> MutexGuard<'_, Phase> {
    match self.phase.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  /// Lock the phase and check that a runtime is attached. State
  /// transitions keep the guard while they hold the gate, so a concurrent
  /// shutdown cannot slip in between the check and the change.
  fn initialized_phase(&self) -> Result<MutexGuard<'_, Phase>, HookError> {
    let phase = self.lock_phase();
    if matches!(*phase, Phase::Uninitialized) {
      return Err(HookError::NotInitialized);
    }
    Ok(phase)
  }

  pub(crate) fn is_recording(&self) -> bool {
    self.recording.load(Ordering::Acquire)
  }

  pub(crate) fn stop_recording(&self) {
    let _gate = self.write_gate();
    self.recording.store(false, Ordering::Release);
  }

  pub(crate) fn method_enter(&self, frame: FrameMetadata) {
    stack_capture::push_frame(self.id, frame);
  }

  pub(crate) fn method_leave(&self) {
    stack_capture::pop_frame(self.id);
  }

  pub(crate) fn record_allocation(&self, event: &AllocationEvent) {
    if !self.recording.load(Ordering::Acquire) {
      return;
    }

    let _gate = self.read_gate();

    // Re-check under the gate: pause may have won the race.
    if !self.recording.load(Ordering::Acquire) {
      return;
    }

    let captured = stack_capture::with_frames(self.id, |frames| {
      self.capturer.capture(frames)
    });

    match captured {
      Some(site) => {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.aggregator.record(&site, event, epoch);
      }
      None => self.aggregator.record_unattributed(),
    }
  }

  fn reset_tables(&self) {
    self.aggregator.reset();
    self.sites.reset();
  }
}

/// Entry point for attaching to a runtime, recording allocations, and
/// producing snapshots.
///
/// Cloning is cheap; all clones share the same session.
#[derive(Clone, Debug)]
pub struct Profiler {
  inner: Arc<ProfilerInner>,
}

impl Profiler {
  /// A profiler that attaches to Mono with the default configuration.
  #[must_use]
  pub fn new() -> Self {
    Self::builder().finish()
  }

  #[must_use]
  pub fn builder() -> ProfilerBuilder {
    ProfilerBuilder::new()
  }

  #[must_use]
  pub fn with_backend(
    config: ProfilerConfig,
    backend: Box<dyn RuntimeBackend>,
  ) -> Self {
    let sites = Arc::new(SiteTable::new());
    let inner = ProfilerInner {
      aggregator: Aggregator::new(),
      backend,
      capturer: StackCapturer::new(Arc::clone(&sites), &config),
      config,
      epoch: AtomicU64::new(0),
      gate: RwLock::new(()),
      id: NEXT_PROFILER_ID.fetch_add(1, Ordering::Relaxed),
      phase: Mutex::new(Phase::Uninitialized),
      recording: AtomicBool::new(false),
      sites,
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  #[must_use]
  pub fn config(&self) -> &ProfilerConfig {
    &self.inner.config
  }

  /// Hook-facing handle that feeds events into this profiler.
  #[must_use]
  pub fn sink(&self) -> EventSink {
    EventSink::new(Arc::downgrade(&self.inner))
  }

  /// Attach to the runtime module at `module_path`. The profiler starts
  /// paused with empty tables.
  ///
  /// # Errors
  ///
  /// Returns `HookError::AlreadyInitialized` if attached already, or
  /// `HookError::AttachFailed` if the backend cannot instrument the module.
  pub fn init(&self, module_path: impl AsRef<Path>) -> Result<(), HookError> {
    let module_path = module_path.as_ref();
    let mut phase = self.inner.lock_phase();

    if matches!(*phase, Phase::Initialized { .. }) {
      debug!(module = %module_path.display(), "profiler already initialized");
      return Err(HookError::AlreadyInitialized);
    }

    let hook = match self.inner.backend.attach(module_path, self.sink()) {
      Ok(hook) => hook,
      Err(err) => {
        warn!(
          backend = self.inner.backend.name(),
          module = %module_path.display(),
          error = %err,
          "failed to attach profiler"
        );
        return Err(err);
      }
    };

    {
      let _gate = self.inner.write_gate();
      self.inner.recording.store(false, Ordering::Release);
      self.inner.reset_tables();
    }

    info!(
      backend = self.inner.backend.name(),
      module = %module_path.display(),
      "profiler attached"
    );
    *phase = Phase::Initialized { hook };
    Ok(())
  }

  #[must_use]
  pub fn is_initialized(&self) -> bool {
    self.inner.initialized_phase().is_ok()
  }

  #[must_use]
  pub fn is_recording(&self) -> bool {
    self.inner.is_recording()
  }

  /// Stop recording. Once this returns no counter changes until `resume`.
  ///
  /// # Errors
  ///
  /// Returns `HookError::NotInitialized` outside a session.
  pub fn pause(&self) -> Result<(), HookError> {
    let _phase = self.inner.initialized_phase()?;
    let _gate = self.inner.write_gate();
    if self.inner.recording.swap(false, Ordering::AcqRel) {
      debug!("profiler paused");
    }
    Ok(())
  }

  /// Start recording and begin a new delta interval. Allocations made while
  /// paused are not replayed.
  ///
  /// # Errors
  ///
  /// Returns `HookError::NotInitialized` outside a session.
  pub fn resume(&self) -> Result<(), HookError> {
    let _phase = self.inner.initialized_phase()?;
    let _gate = self.inner.write_gate();
    let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
    self.inner.recording.store(true, Ordering::Release);
    debug!(epoch, "profiler resumed");
    Ok(())
  }

  /// Drop every record. The paused/running state is unchanged.
  ///
  /// # Errors
  ///
  /// Returns `HookError::NotInitialized` outside a session.
  pub fn clear(&self) -> Result<(), HookError> {
    let _phase = self.inner.initialized_phase()?;
    let _gate = self.inner.write_gate();
    let sites = self.inner.aggregator.len();
    self.inner.reset_tables();
    debug!(sites, "profiler cleared");
    Ok(())
  }

  /// Detach from the runtime and return to the uninitialized state.
  ///
  /// # Errors
  ///
  /// Returns `HookError::NotInitialized` outside a session.
  pub fn shutdown(&self) -> Result<(), HookError> {
    let mut phase = self.inner.lock_phase();
    let previous = std::mem::replace(&mut *phase, Phase::Uninitialized);

    let Phase::Initialized { hook } = previous else {
      return Err(HookError::NotInitialized);
    };

    {
      let _gate = self.inner.write_gate();
      self.inner.recording.store(false, Ordering::Release);
      self.inner.reset_tables();
    }

    info!(module = %hook.module().display(), "profiler detached");
    drop(hook);
    Ok(())
  }

  /// Feed an allocation on the calling thread, attributed to the frames
  /// entered on this thread through the sink.
  pub fn record_event(&self, event: AllocationEvent) {
    self.inner.record_allocation(&event);
  }

  /// Freeze the current state. The copy is taken under the exclusive gate,
  /// so it is consistent even while recording.
  ///
  /// # Errors
  ///
  /// Returns `HookError::NotInitialized` outside a session.
  pub fn snapshot(&self) -> Result<Snapshot, HookError> {
    let _phase = self.inner.initialized_phase()?;
    let _gate = self.inner.write_gate();
    let epoch = self.inner.epoch.load(Ordering::Acquire);
    Ok(Snapshot::new(
      self.inner.aggregator.records(epoch),
      self.inner.aggregator.unattributed_events(),
    ))
  }

  /// Write a dump of one frozen snapshot to `path`. The format follows the
  /// extension, falling back to the configured default.
  ///
  /// # Errors
  ///
  /// Returns `DumpError::Hook` outside a session and `DumpError::Io` if the
  /// file cannot be written. The recorded state is unaffected either way.
  pub fn dump(
    &self,
    path: impl AsRef<Path>,
    details: bool,
  ) -> Result<(), DumpError> {
    let path = path.as_ref();
    let snapshot = self.snapshot()?;
    let format =
      DumpFormat::for_path(path).unwrap_or(self.inner.config.dump_format);

    snapshot.dump_to_path(path, details, format)?;
    debug!(
      path = %path.display(),
      details,
      methods = snapshot.len(),
      "profiler dumped"
    );
    Ok(())
  }
}

impl Default for Profiler {
  fn default() -> Self {
    Self::new()
  }
}
