//! Store-wide configuration (spec §4.2's feedback-loop bound, §4.4's
//! default history capacity, ambient-stack concern named in SPEC_FULL.md
//! §2).

/// Configuration applied when a [`crate::Store`] is created.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Number of re-entrant flush passes permitted before the scheduler
    /// surfaces [`crate::CoreError::FeedbackLoop`] (spec §4.2 default 32).
    pub feedback_bound: u32,
    /// Default `maxHistory` used by `enableHistory` when the caller does
    /// not supply one.
    pub default_history_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            feedback_bound: 32,
            default_history_capacity: 50,
        }
    }
}

impl StoreConfig {
    /// Starts a builder seeded with defaults.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder(StoreConfig::default())
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder(StoreConfig);

impl StoreConfigBuilder {
    /// Sets the re-entrant flush bound.
    pub fn feedback_bound(mut self, bound: u32) -> Self {
        self.0.feedback_bound = bound;
        self
    }

    /// Sets the default history ring-buffer capacity.
    pub fn default_history_capacity(mut self, capacity: usize) -> Self {
        self.0.default_history_capacity = capacity;
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> StoreConfig {
        self.0
    }
}
