use chrono::{Duration, NaiveDateTime};
use tracing::{debug, warn};

use crate::{config::ControllerConfig, state::StateManager, types::HvacMode};

/// Watches an active episode for overrun or lack of progress.
///
/// Once either limit is crossed the fallback stays latched until
/// `stop_monitoring`, even if progress shows up afterwards.
#[derive(Debug, Clone)]
pub struct Monitor {
    algorithm_timeout: Duration,
    progress_timeout: Duration,
    progress_lookback: Duration,
    progress_threshold: f32,

    start_time: Option<NaiveDateTime>,
    last_progress_time: Option<NaiveDateTime>,
    fallback: bool,
}

impl Monitor {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            algorithm_timeout: config.algorithm_timeout(),
            progress_timeout: config.progress_timeout(),
            progress_lookback: config.progress_lookback(),
            progress_threshold: config.progress_threshold,
            start_time: None,
            last_progress_time: None,
            fallback: false,
        }
    }

    pub fn start_monitoring(&mut self, now: NaiveDateTime) {
        self.start_time = Some(now);
        self.last_progress_time = Some(now);
        self.fallback = false;
    }

    pub fn stop_monitoring(&mut self) {
        self.start_time = None;
        self.last_progress_time = None;
        self.fallback = false;
    }

    pub fn is_monitoring(&self) -> bool {
        self.start_time.is_some()
    }

    pub fn start_time(&self) -> Option<NaiveDateTime> {
        self.start_time
    }

    pub fn last_progress_time(&self) -> Option<NaiveDateTime> {
        self.last_progress_time
    }

    /// Returns true when some active zone moved the expected way.
    pub fn check_progress(
        &mut self,
        state: &StateManager,
        mode: HvacMode,
        now: NaiveDateTime,
    ) -> bool {
        if !self.is_monitoring() {
            return false;
        }

        let reference = now - self.progress_lookback;
        let moving = state.zones().values().filter(|zone| zone.is_active).find(|zone| {
            let Some(before) = state.temperature_at(&zone.name, reference) else {
                return false;
            };
            let delta = match mode {
                HvacMode::Heat => zone.current_temp - before,
                HvacMode::Cool => before - zone.current_temp,
                _ => return false,
            };
            delta > self.progress_threshold
        });

        match moving {
            Some(zone) => {
                debug!("zone {} is making progress", zone.name);
                self.last_progress_time = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn should_fallback(&mut self, now: NaiveDateTime) -> bool {
        if self.fallback {
            return true;
        }
        let (Some(start), Some(progress)) = (self.start_time, self.last_progress_time) else {
            return false;
        };

        if now - start >= self.algorithm_timeout {
            warn!(
                "episode running for {} minutes, falling back",
                (now - start).num_minutes()
            );
            self.fallback = true;
        } else if now - progress >= self.progress_timeout {
            warn!(
                "no temperature progress for {} minutes, falling back",
                (now - progress).num_minutes()
            );
            self.fallback = true;
        }
        self.fallback
    }
}
