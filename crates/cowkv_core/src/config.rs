//! Database configuration.

/// Configuration for a [`crate::KeyValueDb`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to sync the transaction log to durable storage on every
    /// commit. Turning this off trades durability of the latest commits
    /// for throughput.
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_syncs_on_commit() {
        assert!(Config::default().sync_on_commit);
    }
}
