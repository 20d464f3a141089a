//! Configuration for loading a [`Runtime`](crate::Runtime).
use crate::error::ConfigError;

/// Configures a [`Runtime`](crate::Runtime) prior to loading it.
///
/// # Examples
///
/// ```
/// use mycosched::Config;
///
/// let config = Config::new(8)
///     .named("example")
///     .with_smt(2)
///     .with_nodes(2)
///     .with_max_queues(16);
/// assert_eq!(config.nr_cpus(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) name: Option<String>,
    pub(crate) nr_cpus: usize,
    pub(crate) threads_per_core: usize,
    pub(crate) nr_nodes: usize,
    pub(crate) max_queues: usize,
    pub(crate) dispatch_batch: usize,
    pub(crate) queue_capacity: usize,
}

impl Config {
    /// The largest supported number of CPUs.
    pub const MAX_CPUS: usize = 8192;

    /// The default maximum number of user dispatch queues.
    pub const DEFAULT_MAX_QUEUES: usize = 1024;

    /// The largest number of speculative dispatches an invocation may buffer.
    pub const MAX_DISPATCH_SLOTS: usize = 32;

    /// The default number of tasks a single dispatch queue may hold.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 16;

    /// Returns a new `Config` for a machine with `nr_cpus` CPUs, one thread
    /// per core, and a single NUMA node.
    #[must_use]
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            name: None,
            nr_cpus,
            threads_per_core: 1,
            nr_nodes: 1,
            max_queues: Self::DEFAULT_MAX_QUEUES,
            dispatch_batch: Self::MAX_DISPATCH_SLOTS,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Returns a new `Config` sized to the number of CPUs available to this
    /// process.
    #[must_use]
    pub fn from_host() -> Self {
        let nr_cpus = match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(error) => {
                tracing::warn!(%error, "could not determine CPU count, assuming 1");
                1
            }
        };
        Self::new(nr_cpus)
    }

    /// Names the policy, for diagnostics.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of hardware threads per SMT sibling group.
    ///
    /// This must evenly divide the number of CPUs.
    #[must_use]
    pub fn with_smt(self, threads_per_core: usize) -> Self {
        Self {
            threads_per_core,
            ..self
        }
    }

    /// Sets the number of NUMA nodes.
    #[must_use]
    pub fn with_nodes(self, nr_nodes: usize) -> Self {
        Self { nr_nodes, ..self }
    }

    /// Sets the maximum number of user dispatch queues.
    #[must_use]
    pub fn with_max_queues(self, max_queues: usize) -> Self {
        Self { max_queues, ..self }
    }

    /// Sets the number of speculative dispatch slots each invocation gets.
    ///
    /// This may not exceed [`Config::MAX_DISPATCH_SLOTS`].
    #[must_use]
    pub fn with_dispatch_batch(self, dispatch_batch: usize) -> Self {
        Self {
            dispatch_batch,
            ..self
        }
    }

    /// Sets the maximum number of tasks a single dispatch queue may hold.
    #[must_use]
    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    /// Returns the configured name, if there is one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the configured number of CPUs.
    #[must_use]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Returns the configured maximum number of user dispatch queues.
    #[must_use]
    pub fn max_queues(&self) -> usize {
        self.max_queues
    }

    /// Returns the configured number of dispatch slots per invocation.
    #[must_use]
    pub fn dispatch_batch(&self) -> usize {
        self.dispatch_batch
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_cpus == 0 {
            return Err(ConfigError::InvalidTopology("there must be at least one CPU"));
        }
        if self.nr_cpus > Self::MAX_CPUS {
            return Err(ConfigError::InvalidTopology("too many CPUs"));
        }
        if self.threads_per_core == 0 || self.nr_cpus % self.threads_per_core != 0 {
            return Err(ConfigError::InvalidTopology(
                "threads per core must evenly divide the number of CPUs",
            ));
        }
        if self.nr_nodes == 0 || self.nr_nodes > self.nr_cpus {
            return Err(ConfigError::InvalidTopology(
                "there must be between 1 and `nr_cpus` NUMA nodes",
            ));
        }
        if self.dispatch_batch == 0 || self.dispatch_batch > Self::MAX_DISPATCH_SLOTS {
            return Err(ConfigError::InvalidTopology(
                "dispatch batch must be between 1 and `MAX_DISPATCH_SLOTS`",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidTopology("queue capacity must not be zero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_host()
    }
}
