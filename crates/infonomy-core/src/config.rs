//! Runtime configuration (§6 "Configuration").
//!
//! `Config` carries plain values; `infonomy-server`'s CLI layer is
//! responsible for assembling one from flags/env/defaults, layering CLI
//! flags over environment variables over these defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Step 5 fast poll interval.
    pub bot_fast_poll_s: u64,
    /// Step 5 slow poll interval.
    pub bot_slow_poll_s: u64,
    /// When fast polling ends and slow polling begins.
    pub bot_fast_window_s: u64,
    /// Hard deadline for step 5 waiting.
    pub bot_deadline_s: u64,
    pub insp_max_depth: u32,
    pub insp_max_breadth: u32,
    pub agent_max_retries: u32,
    pub llm_default_max_tokens: u32,
    pub llm_default_temperature: f32,
    pub daily_bonus_default: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_fast_poll_s: 1,
            bot_slow_poll_s: 3,
            bot_fast_window_s: 30,
            bot_deadline_s: 60,
            insp_max_depth: 3,
            insp_max_breadth: 3,
            agent_max_retries: 4,
            llm_default_max_tokens: 500,
            llm_default_temperature: 0.7,
            daily_bonus_default: 10.0,
        }
    }
}

impl Config {
    pub fn bot_fast_poll(&self) -> Duration {
        Duration::from_secs(self.bot_fast_poll_s)
    }

    pub fn bot_slow_poll(&self) -> Duration {
        Duration::from_secs(self.bot_slow_poll_s)
    }

    pub fn bot_fast_window(&self) -> Duration {
        Duration::from_secs(self.bot_fast_window_s)
    }

    pub fn bot_deadline(&self) -> Duration {
        Duration::from_secs(self.bot_deadline_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.bot_fast_poll_s, 1);
        assert_eq!(cfg.bot_slow_poll_s, 3);
        assert_eq!(cfg.bot_fast_window_s, 30);
        assert_eq!(cfg.bot_deadline_s, 60);
        assert_eq!(cfg.insp_max_depth, 3);
        assert_eq!(cfg.insp_max_breadth, 3);
        assert_eq!(cfg.agent_max_retries, 4);
        assert_eq!(cfg.daily_bonus_default, 10.0);
    }
}
