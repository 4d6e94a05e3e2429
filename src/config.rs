use crate::export::DumpFormat;

/// Controls how the profiler attributes and exports allocations.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
  /// Whether to append native frames after the managed ones.
  pub capture_native: bool,
  /// Format used by `dump` when the path has no recognised extension.
  pub dump_format: DumpFormat,
  /// Managed frames whose class starts with any of these prefixes belong to
  /// the profiler itself and never appear in stack keys.
  pub excluded_class_prefixes: Vec<String>,
  /// Maximum number of frames rendered into a stack key.
  pub max_stack_depth: u16,
  /// Native frames skipped before recording, to hide the hook machinery.
  pub native_skip_frames: usize,
}

impl Default for ProfilerConfig {
  fn default() -> Self {
    Self {
      capture_native: false,
      dump_format: DumpFormat::Xml,
      excluded_class_prefixes: vec!["MonoProfiler".to_string()],
      max_stack_depth: 16,
      native_skip_frames: 4,
    }
  }
}

impl ProfilerConfig {
  /// Default configuration overlaid with `MONOPROF_*` environment variables.
  #[must_use]
  pub fn from_env() -> Self {
    Self::default().overlay(|name| std::env::var(name).ok())
  }

  /// Apply overrides from a variable lookup. Unparsable values are logged and
  /// ignored.
  #[must_use]
  pub fn overlay<F>(mut self, lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(raw) = lookup("MONOPROF_MAX_STACK_DEPTH") {
      match raw.trim().parse::<u16>() {
        Ok(depth) => self.max_stack_depth = depth.max(1),
        Err(err) => tracing::warn!(
          value = %raw,
          error = %err,
          "ignoring MONOPROF_MAX_STACK_DEPTH"
        ),
      }
    }

    if let Some(raw) = lookup("MONOPROF_CAPTURE_NATIVE") {
      match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => self.capture_native = true,
        "0" | "false" | "no" | "off" => self.capture_native = false,
        _ => tracing::warn!(value = %raw, "ignoring MONOPROF_CAPTURE_NATIVE"),
      }
    }

    if let Some(raw) = lookup("MONOPROF_EXCLUDE") {
      self.excluded_class_prefixes = raw
        .split(',')
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .collect();
    }

    if let Some(raw) = lookup("MONOPROF_DUMP_FORMAT") {
      match raw.parse::<DumpFormat>() {
        Ok(format) => self.dump_format = format,
        Err(()) => {
          tracing::warn!(value = %raw, "ignoring MONOPROF_DUMP_FORMAT");
        }
      }
    }

    self
  }

  /// Builder-style helper to adjust the maximum stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth.max(1);
    self
  }

  /// Builder-style helper to replace the excluded class prefixes.
  #[must_use]
  pub fn with_excluded_prefixes<I, S>(mut self, prefixes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.excluded_class_prefixes =
      prefixes.into_iter().map(Into::into).collect();
    self
  }
}
