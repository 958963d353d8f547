//! Test fixtures and engine helpers.
//!
//! Provides engines wired to scripted collaborators, so tests can script
//! substrate outcomes, move the clock and inspect bad-record sinks.

use keelson_core::{
    Collaborators, Config, Engine, ManualClock, MemoryStamps, MonotonicOracle, RetryConfig,
    ScriptedSubstrate, StaticLocator,
};
use keelson_storage::MemoryDirectory;
use std::path::Path;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Wall-clock reading the fixture clock starts at.
pub const CLOCK_START_MS: u64 = 1_000_000;

/// Label of the fixture status directory.
pub const STATUS_DIR: &str = "status/";

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Engine configuration used by fixtures.
///
/// Short keep-alive interval and timeout, and retries without backoff.
pub fn test_config() -> Config {
    Config::new()
        .keep_alive_interval(Duration::from_millis(20))
        .transaction_timeout(Duration::from_millis(200))
        .keep_alive_workers(2)
        .resolver_workers(2)
        .retry(RetryConfig::no_delay(5))
}

/// An engine over scripted collaborators, with automatic cleanup.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    /// Substrate double; script outcomes and inspect calls through it.
    pub substrate: Arc<ScriptedSubstrate>,
    /// Routing double.
    pub locator: Arc<StaticLocator>,
    /// Clock driving keep-alive stamps and expiry.
    pub clock: Arc<ManualClock>,
    /// Version stamps written by the read resolver.
    pub stamps: Arc<MemoryStamps>,
    /// Directory bad-record sinks are created in.
    pub status_dir: MemoryDirectory,
    oracle: Arc<MonotonicOracle>,
    config: Config,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over an in-memory transaction log.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates an in-memory engine with `config`.
    pub fn memory_with(config: Config) -> Self {
        init_tracing();
        let parts = Parts::new();
        let engine = Engine::open_in_memory(config.clone(), parts.collaborators())
            .expect("Failed to open in-memory engine");
        parts.into_fixture(engine, config, None)
    }

    /// Creates an engine whose transaction log lives in a temp directory.
    pub fn file() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config();
        let parts = Parts::new();
        let engine = Engine::open(temp_dir.path(), config.clone(), parts.collaborators())
            .expect("Failed to open file engine");
        parts.into_fixture(engine, config, Some(temp_dir))
    }

    /// Returns the engine directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Shuts the engine down and opens it again over the same log.
    ///
    /// The oracle, clock and doubles carry over, as they would in a real
    /// restart where they live outside the process.
    ///
    /// # Panics
    ///
    /// Panics on in-memory engines.
    #[must_use]
    pub fn reopen(self) -> Self {
        let Self {
            engine,
            substrate,
            locator,
            clock,
            stamps,
            status_dir,
            oracle,
            config,
            temp_dir,
        } = self;
        let temp_dir = temp_dir.expect("Only file engines can be reopened");
        engine.shutdown();
        drop(engine);

        let parts = Parts {
            substrate,
            locator,
            clock,
            stamps,
            status_dir,
            oracle,
        };
        let engine = Engine::open(temp_dir.path(), config.clone(), parts.collaborators())
            .expect("Failed to reopen file engine");
        parts.into_fixture(engine, config, Some(temp_dir))
    }

    /// Returns the configured transaction timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.config.transaction_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Moves the clock past the transaction timeout.
    pub fn expire_all(&self) {
        self.clock.advance(self.timeout_ms() + 1);
    }

    /// Returns the lines written to a bad-record file, if it exists.
    pub fn sink_lines(&self, name: &str) -> Option<Vec<String>> {
        self.status_dir
            .contents(name)
            .map(|text| text.lines().map(str::to_string).collect())
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

struct Parts {
    substrate: Arc<ScriptedSubstrate>,
    locator: Arc<StaticLocator>,
    clock: Arc<ManualClock>,
    stamps: Arc<MemoryStamps>,
    status_dir: MemoryDirectory,
    oracle: Arc<MonotonicOracle>,
}

impl Parts {
    fn new() -> Self {
        Self {
            substrate: Arc::new(ScriptedSubstrate::new()),
            locator: Arc::new(StaticLocator::default()),
            clock: Arc::new(ManualClock::new(CLOCK_START_MS)),
            stamps: Arc::new(MemoryStamps::new()),
            status_dir: MemoryDirectory::new(STATUS_DIR),
            oracle: Arc::new(MonotonicOracle::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.oracle.clone(),
            self.substrate.clone(),
            self.locator.clone(),
        )
        .with_clock(self.clock.clone())
        .with_stamper(self.stamps.clone())
        .with_status_dir(Arc::new(self.status_dir.clone()))
    }

    fn into_fixture(self, engine: Engine, config: Config, temp_dir: Option<TempDir>) -> TestEngine {
        TestEngine {
            engine,
            substrate: self.substrate,
            locator: self.locator,
            clock: self.clock,
            stamps: self.stamps,
            status_dir: self.status_dir,
            oracle: self.oracle,
            config,
            temp_dir,
        }
    }
}

/// Runs a test with a temporary in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use keelson_testkit::with_test_engine;
///
/// #[test]
/// fn my_test() {
///     with_test_engine(|t| {
///         let txn = t.begin_transaction().unwrap();
///         // ...
///     });
/// }
/// ```
pub fn with_test_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let fixture = TestEngine::memory();
    f(&fixture)
}

/// Runs a test with a temporary file-backed engine.
pub fn with_file_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let fixture = TestEngine::file();
    f(&fixture)
}

/// Polls `condition` until it holds or five seconds pass.
///
/// Returns whether the condition was met.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
