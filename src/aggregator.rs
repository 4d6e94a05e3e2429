use super::*;

#[derive(Debug, Default)]
struct SiteCounters {
  delta: u64,
  delta_epoch: u64,
  total: u64,
  types: HashMap<Arc<str>, u64>,
}

impl SiteCounters {
  /// Apply one allocation. Counters saturate at `u64::MAX`.
  fn on_allocation(&mut self, type_name: &Arc<str>, size: u64, epoch: u64) {
    if self.delta_epoch != epoch {
      self.delta = 0;
      self.delta_epoch = epoch;
    }

    self.total = self.total.saturating_add(size);
    self.delta = self.delta.saturating_add(size);

    match self.types.get_mut(type_name) {
      Some(bytes) => *bytes = bytes.saturating_add(size),
      None => {
        self.types.insert(Arc::clone(type_name), size);
      }
    }
  }

  fn delta_at(&self, epoch: u64) -> u64 {
    if self.delta_epoch == epoch {
      self.delta
    } else {
      0
    }
  }
}

/// Live counters for one allocation site.
#[derive(Debug)]
struct SiteStats {
  counters: Mutex<SiteCounters>,
  method: Arc<str>,
  site_id: SiteId,
  stack: CallStackKey,
}

impl SiteStats {
  fn lock_counters(&self) -> MutexGuard<'_, SiteCounters> {
    match self.counters.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn to_record(&self, epoch: u64) -> MethodRecord {
    let counters = self.lock_counters();

    let mut types: Vec<TypeRecord> = counters
      .types
      .iter()
      .map(|(name, bytes)| TypeRecord {
        bytes: *bytes,
        name: Arc::clone(name),
      })
      .collect();

    types.sort_by(|a, b| {
      b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name))
    });

    MethodRecord {
      delta_bytes: counters.delta_at(epoch),
      name: Arc::clone(&self.method),
      site_id: self.site_id,
      stack: self.stack.clone(),
      total_bytes: counters.total,
      types,
    }
  }
}

/// Aggregates allocation events keyed by allocation site.
///
/// The table is sharded; inserting a new site locks one shard, and updating
/// an existing site only locks that site's counters.
#[derive(Debug)]
pub struct Aggregator {
  sites: DashMap<SiteId, Arc<SiteStats>, BuildNoHashHasher<SiteId>>,
  unattributed_events: AtomicU64,
}

impl Default for Aggregator {
  fn default() -> Self {
    Self {
      sites: DashMap::with_hasher(BuildNoHashHasher::default()),
      unattributed_events: AtomicU64::new(0),
    }
  }
}

impl Aggregator {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Add one allocation to the site's total, delta and type bucket as a
  /// single unit.
  pub fn record(
    &self,
    site: &CapturedStack,
    event: &AllocationEvent,
    epoch: u64,
  ) {
    let stats = self.site(site);
    stats
      .lock_counters()
      .on_allocation(&event.type_name, event.size, epoch);
  }

  /// Count an allocation that had no attributable managed frame.
  pub fn record_unattributed(&self) {
    let _ = self.unattributed_events.fetch_update(
      Ordering::Relaxed,
      Ordering::Relaxed,
      |count| Some(count.saturating_add(1)),
    );
  }

  fn site(&self, site: &CapturedStack) -> Arc<SiteStats> {
    if let Some(existing) = self.sites.get(&site.site_id) {
      return Arc::clone(existing.value());
    }

    let entry = self.sites.entry(site.site_id).or_insert_with(|| {
      trace!(
        site_id = site.site_id,
        stack = %site.stack,
        "new allocation site"
      );
      Arc::new(SiteStats {
        counters: Mutex::new(SiteCounters::default()),
        method: Arc::clone(&site.method),
        site_id: site.site_id,
        stack: site.stack.clone(),
      })
    });

    Arc::clone(entry.value())
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.sites.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.sites.is_empty()
  }

  #[must_use]
  pub fn unattributed_events(&self) -> u64 {
    self.unattributed_events.load(Ordering::Relaxed)
  }

  /// Clears all aggregated statistics.
  pub fn reset(&self) {
    self.sites.clear();
    self.unattributed_events.store(0, Ordering::Relaxed);
  }

  /// Copy every site into frozen records. `epoch` is the current resume
  /// epoch; deltas recorded under an older epoch read as zero.
  #[must_use]
  pub fn records(&self, epoch: u64) -> Vec<MethodRecord> {
    let mut records: Vec<MethodRecord> = self
      .sites
      .iter()
      .map(|entry| entry.value().to_record(epoch))
      .collect();

    records.sort_by(|a, b| {
      b.total_bytes
        .cmp(&a.total_bytes)
        .then_with(|| a.stack.cmp(&b.stack))
    });

    records
  }
}
