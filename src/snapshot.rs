use super::*;

/// Bytes of one allocated type at one site.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct TypeRecord {
  pub bytes: u64,
  pub name: Arc<str>,
}

/// Frozen statistics for one allocation site.
#[derive(Debug, Clone, Serialize)]
pub struct MethodRecord {
  /// Bytes allocated since the last resume.
  pub delta_bytes: u64,
  /// `Class.Method` of the allocating method.
  pub name: Arc<str>,
  pub site_id: SiteId,
  pub stack: CallStackKey,
  /// Bytes allocated since the last clear.
  pub total_bytes: u64,
  /// Per-type breakdown, largest first.
  pub types: Vec<TypeRecord>,
}

impl MethodRecord {
  /// Sum of the per-type buckets; equals `total_bytes` unless saturated.
  #[must_use]
  pub fn type_total(&self) -> u64 {
    self
      .types
      .iter()
      .fold(0u64, |sum, ty| sum.saturating_add(ty.bytes))
  }

  #[must_use]
  pub fn type_bytes(&self, name: &str) -> Option<u64> {
    self
      .types
      .iter()
      .find(|ty| ty.name.as_ref() == name)
      .map(|ty| ty.bytes)
  }

  /// Begin iterating this record's allocated types.
  #[must_use]
  pub fn objects(&self) -> ObjectCursor<'_> {
    ObjectCursor::new(&self.types)
  }
}

/// Immutable view of the aggregate state at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
  records: Vec<MethodRecord>,
  #[serde(skip)]
  taken_at: SystemTime,
  unattributed_events: u64,
}

impl Default for Snapshot {
  fn default() -> Self {
    Self::new(Vec::new(), 0)
  }
}

impl Snapshot {
  #[must_use]
  pub(crate) fn new(
    records: Vec<MethodRecord>,
    unattributed_events: u64,
  ) -> Self {
    Self {
      records,
      taken_at: SystemTime::now(),
      unattributed_events,
    }
  }

  #[must_use]
  pub fn records(&self) -> &[MethodRecord] {
    &self.records
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.records.len()
  }

  #[must_use]
  pub fn taken_at(&self) -> SystemTime {
    self.taken_at
  }

  /// Allocations that had no managed frame to be attributed to.
  #[must_use]
  pub fn unattributed_events(&self) -> u64 {
    self.unattributed_events
  }

  #[must_use]
  pub fn total_bytes(&self) -> u64 {
    self
      .records
      .iter()
      .fold(0u64, |sum, record| sum.saturating_add(record.total_bytes))
  }

  /// Every record whose method matches `name`, one per call stack.
  pub fn by_method<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Iterator<Item = &'a MethodRecord> + 'a {
    self
      .records
      .iter()
      .filter(move |record| record.name.as_ref() == name)
  }

  #[must_use]
  pub fn find_stack(&self, stack: &str) -> Option<&MethodRecord> {
    self
      .records
      .iter()
      .find(|record| record.stack.as_str() == stack)
  }

  /// Begin a method iteration positioned on the first record.
  #[must_use]
  pub fn methods(&self) -> MethodCursor<'_> {
    MethodCursor::new(&self.records)
  }
}

/// Cursor over the methods of a snapshot.
///
/// A fresh cursor is positioned on the first record; `advance` moves to the
/// next one and reports whether a record is current afterwards.
#[derive(Debug, Clone)]
pub struct MethodCursor<'a> {
  position: usize,
  records: &'a [MethodRecord],
}

impl<'a> MethodCursor<'a> {
  fn new(records: &'a [MethodRecord]) -> Self {
    Self {
      position: 0,
      records,
    }
  }

  /// Move to the next record. Returns `false` once the end is reached.
  pub fn advance(&mut self) -> bool {
    if self.position < self.records.len() {
      self.position += 1;
    }
    self.position < self.records.len()
  }

  /// The record under the cursor.
  ///
  /// # Errors
  ///
  /// Returns `IterationError::NoCurrent` when the snapshot is empty or the
  /// cursor has moved past the last record.
  pub fn current(&self) -> Result<&'a MethodRecord, IterationError> {
    self.records.get(self.position).ok_or(IterationError::NoCurrent)
  }

  /// Begin iterating the current record's types.
  ///
  /// # Errors
  ///
  /// Returns `IterationError::NoCurrent` when no record is current.
  pub fn objects(&self) -> Result<ObjectCursor<'a>, IterationError> {
    self.current().map(|record| ObjectCursor::new(&record.types))
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.position
  }
}

impl<'a> Iterator for MethodCursor<'a> {
  type Item = &'a MethodRecord;

  /// Yield the current record and step past it.
  fn next(&mut self) -> Option<Self::Item> {
    let record = self.current().ok()?;
    self.advance();
    Some(record)
  }
}

/// Cursor over the types allocated by one method record.
#[derive(Debug, Clone)]
pub struct ObjectCursor<'a> {
  position: usize,
  types: &'a [TypeRecord],
}

impl<'a> ObjectCursor<'a> {
  fn new(types: &'a [TypeRecord]) -> Self {
    Self { position: 0, types }
  }

  pub fn advance(&mut self) -> bool {
    if self.position < self.types.len() {
      self.position += 1;
    }
    self.position < self.types.len()
  }

  /// # Errors
  ///
  /// Returns `IterationError::NoCurrent` past the last type.
  pub fn current(&self) -> Result<&'a TypeRecord, IterationError> {
    self.types.get(self.position).ok_or(IterationError::NoCurrent)
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.position
  }
}

impl<'a> Iterator for ObjectCursor<'a> {
  type Item = &'a TypeRecord;

  fn next(&mut self) -> Option<Self::Item> {
    let ty = self.current().ok()?;
    self.advance();
    Some(ty)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(name: &str, stack: &str, types: &[(&str, u64)]) -> MethodRecord {
    let types: Vec<TypeRecord> = types
      .iter()
      .map(|(name, bytes)| TypeRecord {
        bytes: *bytes,
        name: Arc::from(*name),
      })
      .collect();
    let total_bytes = types.iter().map(|ty| ty.bytes).sum();

    MethodRecord {
      delta_bytes: 0,
      name: Arc::from(name),
      site_id: 1,
      stack: CallStackKey::render(&[FrameMetadata::parse(stack)]),
      total_bytes,
      types,
    }
  }

  #[test]
  fn method_cursor_walks_every_record() {
    let snapshot = Snapshot::new(
      vec![
        record("A.Run", "A.Run", &[("Foo", 30)]),
        record("B.Run", "B.Run", &[("Bar", 10)]),
      ],
      0,
    );

    let mut cursor = snapshot.methods();
    assert_eq!(cursor.current().map(|r| r.name.as_ref()), Ok("A.Run"));
    assert!(cursor.advance());
    assert_eq!(cursor.current().map(|r| r.name.as_ref()), Ok("B.Run"));
    assert!(!cursor.advance());
    assert_eq!(cursor.current().err(), Some(IterationError::NoCurrent));
    assert!(!cursor.advance());
  }

  #[test]
  fn empty_snapshot_has_no_current() {
    let snapshot = Snapshot::default();
    let cursor = snapshot.methods();

    assert!(snapshot.is_empty());
    assert_eq!(cursor.current().err(), Some(IterationError::NoCurrent));
    assert_eq!(cursor.objects().err(), Some(IterationError::NoCurrent));
  }

  #[test]
  fn object_cursor_is_scoped_to_current_method() {
    let snapshot = Snapshot::new(
      vec![record("A.Run", "A.Run", &[("Foo", 30), ("Bar", 20)])],
      0,
    );

    let cursor = snapshot.methods();
    let names: Vec<_> = cursor
      .objects()
      .expect("current method")
      .map(|ty| ty.name.to_string())
      .collect();

    assert_eq!(names, vec!["Foo", "Bar"]);
  }

  #[test]
  fn cursor_iterates_like_an_iterator() {
    let snapshot = Snapshot::new(
      vec![
        record("A.Run", "A.Run", &[("Foo", 3)]),
        record("A.Run", "A.Other", &[("Foo", 2)]),
      ],
      0,
    );

    assert_eq!(snapshot.methods().count(), 2);
    assert_eq!(snapshot.by_method("A.Run").count(), 2);
    assert_eq!(snapshot.total_bytes(), 5);
    assert!(snapshot.find_stack("#0 A.Other").is_some());
  }
}
