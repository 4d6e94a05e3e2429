//! Allocation profiler engine for embedded Mono runtimes.
//!
//! The engine hooks the runtime's allocation and method enter/leave
//! callbacks, attributes every allocation to the managed call stack that
//! produced it, and keeps per-site and per-type byte counters that can be
//! frozen into snapshots, iterated, and dumped to disk.

mod aggregator;
mod config;
mod error;
mod event;
mod export;
pub mod hook;
pub mod session;
mod snapshot;
mod stack;
mod stack_capture;
mod state;

use {
  backtrace::{Frame, SymbolName},
  dashmap::DashMap,
  nohash_hasher::{BuildNoHashHasher, IntMap},
  serde::Serialize,
  std::{
    cell::RefCell,
    collections::HashMap,
    ffi::OsStr,
    fmt::{self, Display, Formatter, Write as _},
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
      Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::SystemTime,
  },
  tracing::{debug, info, trace, warn},
};

pub use {
  aggregator::Aggregator,
  config::ProfilerConfig,
  error::{DumpError, HookError, IterationError},
  event::{AllocationEvent, GcEvent},
  export::{DumpFormat, JsonLinesWriter, SnapshotStreamWriter},
  hook::{EventSink, HookHandle, ManualRuntime, MonoRuntime, RuntimeBackend},
  snapshot::{MethodCursor, MethodRecord, ObjectCursor, Snapshot, TypeRecord},
  stack::{CallStackKey, FrameMetadata, SiteId, SiteTable},
  stack_capture::{CapturedStack, StackCapturer},
  state::{Profiler, ProfilerBuilder},
};
