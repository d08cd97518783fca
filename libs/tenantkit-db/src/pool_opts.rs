//! Pool options application trait.

use sea_orm::sqlx::postgres::PgPoolOptions;

use crate::config::PoolCfg;

/// Apply a [`PoolCfg`] to a sqlx pool builder.
pub(crate) trait ApplyPoolOpts {
    fn apply(self, cfg: &PoolCfg) -> Self;
}

impl ApplyPoolOpts for PgPoolOptions {
    fn apply(mut self, cfg: &PoolCfg) -> Self {
        if let Some(n) = cfg.max_conns {
            self = self.max_connections(n);
        }
        if let Some(n) = cfg.min_conns {
            self = self.min_connections(n);
        }
        if let Some(t) = cfg.acquire_timeout {
            self = self.acquire_timeout(t);
        }
        // Always set: `None` here disables sqlx's own default.
        self = self.idle_timeout(cfg.idle_timeout);
        self = self.max_lifetime(cfg.max_lifetime);
        if let Some(test) = cfg.test_before_acquire {
            self = self.test_before_acquire(test);
        }
        self
    }
}
