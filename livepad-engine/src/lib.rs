//! livepad execution engine
//!
//! Runs JavaScript, TypeScript and Python snippets in long-lived worker
//! processes and reports per-line values. The pieces:
//!
//! - [`instrument`]: source rewriting for value reporting and loop guards
//! - [`cache`]: LRU-K cache of instrumented scripts
//! - [`throttle`]: adaptive debounce in front of the registry
//! - [`memory`]: cleanup decisions for long-lived interpreters
//! - [`registry`]: worker lifecycle, dispatch, timeouts and restarts
//! - [`engine`]: the application context owning all of the above

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod memory;
pub mod registry;
pub mod throttle;
pub mod types;
pub mod worker;

pub use cache::{CacheConfig, CacheKey, CacheMetrics, ScriptCache};
pub use config::{EngineConfig, LanguageConfig, LivepadConfig, DEFAULT_DEBUG_FUNCTION};
pub use engine::{Engine, EngineStats, LanguageStats};
pub use error::{EngineError, EngineResult, TimeoutKind, TranspileError};
pub use instrument::{InstrumentOptions, Instrumentor};
pub use memory::{CleanupLevel, MemoryConfig, MemoryManager, MemoryStats};
pub use registry::{ExecutorRegistry, PreparedScript, RestartPolicy, SharedCache, WorkerPhase};
pub use throttle::{Priority, ThrottleConfig, ThrottleError, ThrottleStats, Throttler};
pub use types::{
    ConsoleEntry, DebugEntry, EventKind, ExecutionEvent, ExecutionOptions, ExecutionReport,
    ExecutionRequest,
};
pub use worker::{
    ProcessSpawner, WorkerConnection, WorkerEndpoint, WorkerEvent, WorkerExit, WorkerHandle,
    WorkerSpawner,
};

pub use livepad_common::{ConsoleType, ExecutionId, Language};
