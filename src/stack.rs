use super::*;

/// Identifier of an interned allocation site, i.e. a distinct
/// (method, call-stack key) pair.
pub type SiteId = u64;

/// A single managed frame as reported by the runtime hook.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct FrameMetadata {
  pub class: Arc<str>,
  pub method: Arc<str>,
}

impl FrameMetadata {
  #[must_use]
  pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
    Self {
      class: Arc::<str>::from(class.into()),
      method: Arc::<str>::from(method.into()),
    }
  }

  /// Build a frame from a `Class.Method` string, splitting on the last dot.
  #[must_use]
  pub fn parse(qualified: &str) -> Self {
    match qualified.rsplit_once('.') {
      Some((class, method)) => Self::new(class, method),
      None => Self::new("", qualified),
    }
  }

  /// The `Class.Method` form used in method names and stack keys.
  #[must_use]
  pub fn qualified_name(&self) -> String {
    self.to_string()
  }
}

impl Display for FrameMetadata {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    if self.class.is_empty() {
      f.write_str(&self.method)
    } else {
      write!(f, "{}.{}", self.class, self.method)
    }
  }
}

/// Canonical rendering of a call chain, innermost frame first:
/// `#0 Inner.Method -> #1 Caller.Method -> ...`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CallStackKey(Arc<str>);

impl CallStackKey {
  /// Render a key from frames ordered innermost first.
  #[must_use]
  pub fn render<'a, I>(frames: I) -> Self
  where
    I: IntoIterator<Item = &'a FrameMetadata>,
  {
    let mut rendered = String::new();

    for (depth, frame) in frames.into_iter().enumerate() {
      if depth > 0 {
        rendered.push_str(" -> ");
      }
      let _ = write!(rendered, "#{depth} {frame}");
    }

    Self(Arc::from(rendered))
  }

  #[must_use]
  pub fn as_str(&self) -> &str {
    &self.0
  }

  #[must_use]
  pub fn depth(&self) -> usize {
    if self.0.is_empty() {
      0
    } else {
      self.0.matches(" -> ").count() + 1
    }
  }
}

impl Display for CallStackKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Interns (method, stack key) pairs into stable site identifiers.
///
/// Lookups of known sites only take a shard read lock, so concurrent
/// allocation threads do not serialize on the table.
#[derive(Debug)]
pub struct SiteTable {
  by_key: DashMap<(Arc<str>, CallStackKey), SiteId>,
  next_id: AtomicU64,
}

impl Default for SiteTable {
  fn default() -> Self {
    Self {
      by_key: DashMap::new(),
      next_id: AtomicU64::new(1),
    }
  }
}

impl SiteTable {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the identifier of the site, allocating a new one on first use.
  pub fn intern(&self, method: &Arc<str>, stack: &CallStackKey) -> SiteId {
    let key = (Arc::clone(method), stack.clone());

    if let Some(existing) = self.by_key.get(&key) {
      return *existing;
    }

    *self
      .by_key
      .entry(key)
      .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_key.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_key.is_empty()
  }

  /// Forget every site. Identifiers keep increasing so that records from
  /// before the reset can never be confused with new ones.
  pub fn reset(&self) {
    self.by_key.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_innermost_frame_first() {
    let frames = [
      FrameMetadata::new("Player", "Update"),
      FrameMetadata::new("Game", "Tick"),
    ];
    let key = CallStackKey::render(frames.iter());

    assert_eq!(key.as_str(), "#0 Player.Update -> #1 Game.Tick");
    assert_eq!(key.depth(), 2);
  }

  #[test]
  fn parses_qualified_names() {
    let frame = FrameMetadata::parse("UnityEngine.Object.Instantiate");
    assert_eq!(frame.class.as_ref(), "UnityEngine.Object");
    assert_eq!(frame.method.as_ref(), "Instantiate");

    let bare = FrameMetadata::parse("Main");
    assert_eq!(bare.to_string(), "Main");
  }

  #[test]
  fn interns_and_reuses_site_ids() {
    let table = SiteTable::new();
    let method: Arc<str> = Arc::from("Player.Update");
    let stack = CallStackKey::render(&[FrameMetadata::parse("Player.Update")]);

    let first = table.intern(&method, &stack);
    let second = table.intern(&method, &stack);
    assert_eq!(first, second);
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn distinct_stacks_get_distinct_ids() {
    let table = SiteTable::new();
    let method: Arc<str> = Arc::from("Pool.Take");
    let a = CallStackKey::render(&[
      FrameMetadata::parse("Pool.Take"),
      FrameMetadata::parse("Enemy.Spawn"),
    ]);
    let b = CallStackKey::render(&[
      FrameMetadata::parse("Pool.Take"),
      FrameMetadata::parse("Bullet.Fire"),
    ]);

    assert_ne!(table.intern(&method, &a), table.intern(&method, &b));
  }

  #[test]
  fn reset_never_reuses_ids() {
    let table = SiteTable::new();
    let method: Arc<str> = Arc::from("A.B");
    let stack = CallStackKey::render(&[FrameMetadata::parse("A.B")]);

    let before = table.intern(&method, &stack);
    table.reset();
    assert!(table.is_empty());

    let after = table.intern(&method, &stack);
    assert!(after > before);
  }
}
