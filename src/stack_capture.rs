use super::*;

thread_local! {
  /// Managed frames entered on this thread, outermost first, per profiler.
  static SHADOW_STACKS: RefCell<IntMap<u64, Vec<FrameMetadata>>> =
    RefCell::new(IntMap::default());
}

/// Push a frame onto the calling thread's shadow stack for `profiler_id`.
pub(crate) fn push_frame(profiler_id: u64, frame: FrameMetadata) {
  SHADOW_STACKS.with(|stacks| {
    stacks
      .borrow_mut()
      .entry(profiler_id)
      .or_default()
      .push(frame);
  });
}

/// Pop the innermost frame. Unbalanced leaves are ignored.
pub(crate) fn pop_frame(profiler_id: u64) {
  SHADOW_STACKS.with(|stacks| {
    let mut stacks = stacks.borrow_mut();
    if let Some(frames) = stacks.get_mut(&profiler_id) {
      frames.pop();
      if frames.is_empty() {
        stacks.remove(&profiler_id);
      }
    }
  });
}

pub(crate) fn with_frames<R>(
  profiler_id: u64,
  f: impl FnOnce(&[FrameMetadata]) -> R,
) -> R {
  SHADOW_STACKS.with(|stacks| {
    let stacks = stacks.borrow();
    let frames = stacks.get(&profiler_id).map_or(&[][..], Vec::as_slice);
    f(frames)
  })
}

/// Result of attributing one allocation to its call chain.
#[derive(Debug, Clone)]
pub struct CapturedStack {
  /// `Class.Method` of the innermost attributable frame.
  pub method: Arc<str>,
  pub site_id: SiteId,
  pub stack: CallStackKey,
}

/// Turns shadow stacks into stack keys and interns them through the shared
/// site table.
#[derive(Debug)]
pub struct StackCapturer {
  capture_native: bool,
  excluded_prefixes: Vec<String>,
  max_depth: usize,
  native_skip_frames: usize,
  sites: Arc<SiteTable>,
}

impl StackCapturer {
  #[must_use]
  pub fn new(sites: Arc<SiteTable>, config: &ProfilerConfig) -> Self {
    Self {
      capture_native: config.capture_native,
      excluded_prefixes: config.excluded_class_prefixes.clone(),
      max_depth: usize::from(config.max_stack_depth.max(1)),
      native_skip_frames: config.native_skip_frames,
      sites,
    }
  }

  /// Attribute an allocation made under `managed`, given outermost first.
  ///
  /// Returns `None` when no managed frame survives exclusion, in which case
  /// the allocation cannot be attributed to a method.
  #[must_use]
  pub fn capture(&self, managed: &[FrameMetadata]) -> Option<CapturedStack> {
    let mut frames: Vec<FrameMetadata> = managed
      .iter()
      .rev()
      .filter(|frame| !self.is_excluded(frame))
      .take(self.max_depth)
      .cloned()
      .collect();

    let method: Arc<str> = Arc::from(frames.first()?.qualified_name());

    if self.capture_native && frames.len() < self.max_depth {
      let room = self.max_depth - frames.len();
      frames.extend(self.capture_native_frames(room));
    }

    let stack = CallStackKey::render(frames.iter());
    let site_id = self.sites.intern(&method, &stack);

    Some(CapturedStack {
      method,
      site_id,
      stack,
    })
  }

  fn is_excluded(&self, frame: &FrameMetadata) -> bool {
    self
      .excluded_prefixes
      .iter()
      .any(|prefix| frame.class.starts_with(prefix.as_str()))
  }

  #[must_use]
  fn capture_native_frames(&self, limit: usize) -> Vec<FrameMetadata> {
    let mut frames = Vec::with_capacity(limit);
    let mut remaining_skip = self.native_skip_frames;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if frames.len() >= limit {
        return false;
      }

      frames.push(extract_metadata(frame));
      true
    });

    frames
  }
}

fn extract_metadata(frame: &Frame) -> FrameMetadata {
  let mut filename = None;
  let mut function = None;

  backtrace::resolve_frame(frame, |symbol| {
    if filename.is_none() {
      filename = symbol
        .filename()
        .and_then(|path| path.file_name())
        .and_then(OsStr::to_str)
        .map(str::to_string);
    }

    if function.is_none() {
      function = symbol.name().map(|name| symbol_name_to_string(&name));
    }
  });

  FrameMetadata::new(
    filename.unwrap_or_else(|| "<native>".to_string()),
    function.unwrap_or_else(|| "<unknown>".to_string()),
  )
}

fn symbol_name_to_string(name: &SymbolName<'_>) -> String {
  format!("{name:#}")
}
