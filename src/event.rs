use super::*;

/// A single object allocation observed by the runtime hook.
#[derive(Debug, Clone)]
pub struct AllocationEvent {
  pub size: u64,
  pub type_name: Arc<str>,
}

impl AllocationEvent {
  #[must_use]
  pub fn new(type_name: impl Into<Arc<str>>) -> Self {
    Self {
      size: 0,
      type_name: type_name.into(),
    }
  }

  #[must_use]
  pub fn size(mut self, size: u64) -> Self {
    self.size = size;
    self
  }
}

/// Garbage collector phases reported by the runtime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GcEvent {
  Start,
  MarkStart,
  MarkEnd,
  ReclaimStart,
  ReclaimEnd,
  End,
  PreStopWorld,
  PostStopWorld,
  PreStartWorld,
  PostStartWorld,
  Unknown(i32),
}

impl GcEvent {
  /// Decode the runtime's numeric GC event code.
  #[must_use]
  pub fn from_raw(code: i32) -> Self {
    match code {
      0 => Self::Start,
      1 => Self::MarkStart,
      2 => Self::MarkEnd,
      3 => Self::ReclaimStart,
      4 => Self::ReclaimEnd,
      5 => Self::End,
      6 => Self::PreStopWorld,
      7 => Self::PostStopWorld,
      8 => Self::PreStartWorld,
      9 => Self::PostStartWorld,
      other => Self::Unknown(other),
    }
  }
}
