//! Constructor-injected configuration for the lobby, the pool and the server.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use turk_core::model::{DefaultQuizPolicy, PercentageQuizPolicy, QuizPolicy, SetId};

use crate::error::ConfigError;

//
// ─── LOBBY ─────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyConfig {
    /// Workers per formed group.
    pub group_size: usize,
    /// Admitted workers are ready immediately, without a status update.
    pub auto_ready: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            group_size: 3,
            auto_ready: false,
        }
    }
}

impl LobbyConfig {
    #[must_use]
    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    #[must_use]
    pub fn with_auto_ready(mut self, auto_ready: bool) -> Self {
        self.auto_ready = auto_ready;
        self
    }

    /// # Errors
    ///
    /// Returns `ConfigError::GroupSize` for a zero group size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_size == 0 {
            return Err(ConfigError::GroupSize);
        }
        Ok(())
    }
}

//
// ─── POOL ──────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pre-warm until at least this many idle instances are cached.
    pub low_watermark: usize,
    /// Never cache more idle instances than this.
    pub max_cached: usize,
    pub prewarm_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            low_watermark: 1,
            max_cached: 4,
            prewarm_interval: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_low_watermark(mut self, low_watermark: usize) -> Self {
        self.low_watermark = low_watermark;
        self
    }

    #[must_use]
    pub fn with_max_cached(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached;
        self
    }

    #[must_use]
    pub fn with_prewarm_interval(mut self, prewarm_interval: Duration) -> Self {
        self.prewarm_interval = prewarm_interval;
        self
    }

    /// A pool that never caches; every request builds a fresh instance.
    #[must_use]
    pub fn uncached() -> Self {
        Self {
            low_watermark: 0,
            max_cached: 0,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigError` when the watermark exceeds the cache bound or
    /// the pre-warm interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark > self.max_cached {
            return Err(ConfigError::Watermark {
                low_watermark: self.low_watermark,
                max_cached: self.max_cached,
            });
        }
        if self.prewarm_interval.is_zero() {
            return Err(ConfigError::PrewarmInterval);
        }
        Ok(())
    }
}

//
// ─── QUIZ ──────────────────────────────────────────────────────────────────────
//

/// Which admission policy the lobby applies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuizConfig {
    /// Everyone is admitted.
    #[default]
    Disabled,
    Default,
    Percentage { pass_rate: f64, max_fails: u32 },
}

impl QuizConfig {
    #[must_use]
    pub fn policy(&self) -> Option<Arc<dyn QuizPolicy>> {
        match *self {
            QuizConfig::Disabled => None,
            QuizConfig::Default => Some(Arc::new(DefaultQuizPolicy)),
            QuizConfig::Percentage {
                pass_rate,
                max_fails,
            } => Some(Arc::new(PercentageQuizPolicy::new(pass_rate, max_fails))),
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigError` for a pass rate outside `(0, 1]` or zero
    /// allowed failures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let QuizConfig::Percentage {
            pass_rate,
            max_fails,
        } = *self
        {
            if !(pass_rate > 0.0 && pass_rate <= 1.0) {
                return Err(ConfigError::PassRate(pass_rate));
            }
            if max_fails == 0 {
                return Err(ConfigError::MaxFails);
            }
        }
        Ok(())
    }
}

//
// ─── SERVER ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub set_id: SetId,
    /// Name handed to experiment instances as their host.
    pub host: String,
    pub lobby: LobbyConfig,
    pub pool: PoolConfig,
    pub quiz: QuizConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            set_id: SetId::new("default"),
            host: "turk-server".to_string(),
            lobby: LobbyConfig::default(),
            pool: PoolConfig::default(),
            quiz: QuizConfig::default(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_set_id(mut self, set_id: SetId) -> Self {
        self.set_id = set_id;
        self
    }

    #[must_use]
    pub fn with_lobby(mut self, lobby: LobbyConfig) -> Self {
        self.lobby = lobby;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_quiz(mut self, quiz: QuizConfig) -> Self {
        self.quiz = quiz;
        self
    }

    /// # Errors
    ///
    /// Returns the first `ConfigError` found in any section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Host);
        }
        self.lobby.validate()?;
        self.pool.validate()?;
        self.quiz.validate()
    }
}
