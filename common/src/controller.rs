use chrono::NaiveDateTime;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigKey, ControllerConfig, DynamicConfig, RuntimeConfig},
    config_manager::{ConfigManager, ConfigValue},
    decision::DecisionEngine,
    executor::{Executor, TemperatureOutcome, TemperatureRequest},
    hass::HomeAssistant,
    monitor::Monitor,
    scheduler::TaskQueue,
    state::StateManager,
    types::{ControllerStatus, HvacMode, SeasonalMode, ZoneStatus},
};

pub const ENABLED_SENSOR: &str = "sensor.smart_aircon_enabled";
pub const ALGORITHM_ACTIVE_SENSOR: &str = "sensor.smart_aircon_algorithm_active";
pub const HVAC_MODE_SENSOR: &str = "sensor.smart_aircon_hvac_mode";
pub const ACTIVE_ZONES_SENSOR: &str = "sensor.smart_aircon_active_zones";

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerTask {
    RestoreTargets { episode: u64 },
    ApplyDampers { episode: u64 },
    VerifyTemperature { episode: u64, request: TemperatureRequest },
}

impl ControllerTask {
    pub fn episode(&self) -> u64 {
        match self {
            Self::RestoreTargets { episode }
            | Self::ApplyDampers { episode }
            | Self::VerifyTemperature { episode, .. } => *episode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Activating { mode: HvacMode, episode: u64 },
    Active { mode: HvacMode, episode: u64 },
    /// The episode is over but the unit has not accepted the idle mode yet.
    Deactivating,
}

impl Phase {
    pub fn episode(self) -> Option<u64> {
        match self {
            Self::Idle | Self::Deactivating => None,
            Self::Activating { episode, .. } | Self::Active { episode, .. } => Some(episode),
        }
    }

    pub fn mode(self) -> Option<HvacMode> {
        match self {
            Self::Idle | Self::Deactivating => None,
            Self::Activating { mode, .. } | Self::Active { mode, .. } => Some(mode),
        }
    }
}

/// Periodic coordinator for the central unit and the zone dampers.
///
/// Every entry point takes `now` explicitly and never returns an error:
/// host failures are logged and the last known state is kept.
#[derive(Debug)]
pub struct SmartAirconController {
    config: ControllerConfig,
    state: StateManager,
    config_manager: ConfigManager,
    decision: DecisionEngine,
    executor: Executor,
    monitor: Monitor,
    tasks: TaskQueue<ControllerTask>,
    phase: Phase,
    next_episode: u64,
    last_check: Option<NaiveDateTime>,
}

impl SmartAirconController {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        let mut runtime = runtime.clone();
        runtime.sanitize();
        let config = runtime.controller;

        Self {
            state: StateManager::new(&config, &runtime.zones),
            config_manager: ConfigManager::new(runtime.dynamic, config.config_refresh()),
            decision: DecisionEngine::new(&config),
            executor: Executor::new(&config),
            monitor: Monitor::new(&config),
            tasks: TaskQueue::new(),
            phase: Phase::Idle,
            next_episode: 1,
            last_check: None,
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn dynamic_config(&self) -> &DynamicConfig {
        self.config_manager.config()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn next_task_due(&self) -> Option<NaiveDateTime> {
        self.tasks.next_due()
    }

    /// Checks that every configured entity exists and takes a first reading.
    /// Returns the entity ids that could not be read.
    pub async fn validate_entities<H: HomeAssistant>(
        &mut self,
        host: &H,
        now: NaiveDateTime,
    ) -> Vec<String> {
        let mut entities = vec![self.state.main_climate().to_string()];
        for zone in self.state.zones().values() {
            entities.push(zone.entity_id.clone());
            entities.push(zone.damper_entity.clone());
        }

        let mut missing = Vec::new();
        for entity in entities {
            if let Err(err) = host.get_state(&entity).await {
                warn!("entity {entity} is not usable: {err}");
                missing.push(entity);
            }
        }

        self.state.update_all_zones(host, now).await;
        self.state.update_hvac_mode(host).await;
        info!(
            "validated {} zones, {} missing entities, unit in {}",
            self.state.zones().len(),
            missing.len(),
            self.state.current_hvac_mode()
        );
        missing
    }

    pub async fn periodic_check<H: HomeAssistant>(&mut self, host: &H, now: NaiveDateTime) {
        self.last_check = Some(now);

        if self.config_manager.should_update(now)
            && self.config_manager.update_config(host, now).await
        {
            info!("dynamic config updated: {:?}", self.config_manager.config());
        }
        let dynamic = self.config_manager.config().clone();

        if self.phase == Phase::Deactivating {
            self.state.update_hvac_mode(host).await;
            if !self.send_idle_mode(host).await {
                return;
            }
        }

        if !dynamic.enabled {
            if self.phase != Phase::Idle {
                info!("controller disabled while {:?}, going idle", self.phase);
                self.deactivate_algorithm(host).await;
            }
            return;
        }

        self.state.update_all_zones(host, now).await;
        self.state.update_hvac_mode(host).await;
        self.state.refresh_last_mode_change(host, now).await;

        match self.phase {
            Phase::Idle => self.check_idle(host, &dynamic, now).await,
            Phase::Deactivating => {}
            Phase::Activating { mode, episode } => {
                debug!("episode {episode} still activating {}", mode.as_str());
            }
            Phase::Active { mode, .. } => self.check_active(host, mode, &dynamic, now).await,
        }
    }

    async fn check_idle<H: HomeAssistant>(
        &mut self,
        host: &H,
        dynamic: &DynamicConfig,
        now: NaiveDateTime,
    ) {
        let target = self.decision.get_target_hvac_mode(&self.state, dynamic);
        let current = self.state.current_hvac_mode().to_string();
        debug!("idle: target {} current {current}", target.as_str());

        match HvacMode::parse(&current) {
            Some(running) if running.is_active() && running == target => {
                let episode = self.begin_episode();
                info!("unit already in {current}, adopting as episode {episode}");
                self.phase = Phase::Active {
                    mode: target,
                    episode,
                };
                self.monitor.start_monitoring(now);
            }
            Some(running) if running.is_active() && target.is_idle() => {
                if self.decision.should_switch_to_idle(&self.state, running, now) {
                    info!("unit left in {current} with every zone satisfied");
                    self.deactivate_algorithm(host).await;
                }
            }
            _ => {
                if self
                    .decision
                    .should_activate_algorithm(&self.state, target, &current, now)
                {
                    self.activate_algorithm(host, target, now).await;
                }
            }
        }
    }

    async fn check_active<H: HomeAssistant>(
        &mut self,
        host: &H,
        mode: HvacMode,
        dynamic: &DynamicConfig,
        now: NaiveDateTime,
    ) {
        if dynamic.smart_hvac_mode.active_mode() != Some(mode) {
            let target = self.decision.get_target_hvac_mode(&self.state, dynamic);
            let current = self.state.current_hvac_mode().to_string();
            if self
                .decision
                .should_activate_algorithm(&self.state, target, &current, now)
            {
                info!(
                    "season is now {}, switching to {}",
                    dynamic.smart_hvac_mode.as_str(),
                    target.as_str()
                );
                self.activate_algorithm(host, target, now).await;
            } else {
                info!(
                    "season is now {}, ending {} episode",
                    dynamic.smart_hvac_mode.as_str(),
                    mode.as_str()
                );
                self.deactivate_algorithm(host).await;
            }
            return;
        }

        self.monitor.check_progress(&self.state, mode, now);
        if self.monitor.should_fallback(now) {
            warn!("{} episode is not effective, handing control back", mode.as_str());
            self.deactivate_algorithm(host).await;
            return;
        }

        if self.decision.should_switch_to_idle(&self.state, mode, now) {
            info!("all zones satisfied for {}, going idle", mode.as_str());
            self.deactivate_algorithm(host).await;
        }
    }

    fn begin_episode(&mut self) -> u64 {
        let episode = self.next_episode;
        self.next_episode += 1;
        episode
    }

    /// Starts an episode: the mode is set now, setpoints and dampers follow
    /// as queued steps.
    pub async fn activate_algorithm<H: HomeAssistant>(
        &mut self,
        host: &H,
        mode: HvacMode,
        now: NaiveDateTime,
    ) {
        self.tasks.clear();
        self.monitor.stop_monitoring();

        if !self.executor.set_hvac_mode(host, &mut self.state, mode).await {
            warn!("could not start {}, retrying next cycle", mode.as_str());
            self.phase = Phase::Idle;
            return;
        }

        let episode = self.begin_episode();
        info!("activating {} as episode {episode}", mode.as_str());
        self.phase = Phase::Activating { mode, episode };
        self.tasks.schedule(
            now + self.config.activation_step_delay(),
            ControllerTask::RestoreTargets { episode },
        );
    }

    /// Ends the current episode. Safe to call repeatedly: the idle mode is only
    /// sent when the unit is not already in it. If the unit rejects it the
    /// controller stays in `Phase::Deactivating` and every check retries.
    pub async fn deactivate_algorithm<H: HomeAssistant>(&mut self, host: &H) {
        let dynamic = self.config_manager.config().clone();
        let episode = self.phase.episode();

        let targets: Vec<(String, f32)> = self
            .state
            .zones()
            .values()
            .filter(|zone| zone.is_active)
            .map(|zone| (zone.name.clone(), zone.target_temp))
            .collect();
        for (zone, target) in targets {
            self.executor.save_zone_target(host, &zone, target).await;
        }

        self.send_idle_mode(host).await;
        self.executor
            .set_minimum_dampers(host, &mut self.state, &dynamic)
            .await;

        if let Some(episode) = episode {
            let dropped = self.tasks.cancel_where(|task| task.episode() == episode);
            debug!("episode {episode} ended, {dropped} queued steps dropped");
        }
        self.monitor.stop_monitoring();
    }

    async fn send_idle_mode<H: HomeAssistant>(&mut self, host: &H) -> bool {
        let idle = DecisionEngine::get_idle_mode(self.config_manager.config().smart_hvac_mode);
        if self.executor.set_hvac_mode(host, &mut self.state, idle).await {
            self.phase = Phase::Idle;
            true
        } else {
            warn!("unit did not accept {}, retrying next cycle", idle.as_str());
            self.phase = Phase::Deactivating;
            false
        }
    }

    pub async fn run_due_tasks<H: HomeAssistant>(&mut self, host: &H, now: NaiveDateTime) {
        for task in self.tasks.take_due(now) {
            if self.phase.episode() != Some(task.episode()) {
                debug!("dropping stale {task:?}");
                continue;
            }

            match task {
                ControllerTask::RestoreTargets { episode } => {
                    self.restore_targets(host, episode, now).await;
                    self.tasks.schedule(
                        now + self.config.activation_step_delay(),
                        ControllerTask::ApplyDampers { episode },
                    );
                }
                ControllerTask::ApplyDampers { episode } => {
                    self.apply_dampers(host, episode, now).await;
                }
                ControllerTask::VerifyTemperature {
                    episode,
                    mut request,
                } => match self.executor.verify_temperature(host, &mut request).await {
                    TemperatureOutcome::Confirmed => {}
                    TemperatureOutcome::Retrying { .. } => {
                        self.tasks.schedule(
                            now + self.config.temperature_retry_wait(),
                            ControllerTask::VerifyTemperature { episode, request },
                        );
                    }
                    TemperatureOutcome::Failed => {
                        warn!("giving up on restoring {}", request.entity_id);
                    }
                },
            }
        }
    }

    async fn restore_targets<H: HomeAssistant>(
        &mut self,
        host: &H,
        episode: u64,
        now: NaiveDateTime,
    ) {
        let zones: Vec<(String, String)> = self
            .state
            .zones()
            .values()
            .filter(|zone| zone.is_active)
            .map(|zone| (zone.name.clone(), zone.entity_id.clone()))
            .collect();

        for (name, entity) in zones {
            let Some(target) = self.executor.read_saved_target(host, &name).await else {
                continue;
            };
            info!("zone {name}: restoring target {target:.1}");
            let request = self
                .executor
                .set_zone_temperature_with_retry(host, &entity, target)
                .await;
            if let Some(zone) = self.state.zone_mut(&name) {
                zone.target_temp = target;
            }
            self.tasks.schedule(
                now + self.config.temperature_verify_delay(),
                ControllerTask::VerifyTemperature { episode, request },
            );
        }
    }

    async fn apply_dampers<H: HomeAssistant>(
        &mut self,
        host: &H,
        episode: u64,
        now: NaiveDateTime,
    ) {
        let Phase::Activating { mode, .. } = self.phase else {
            return;
        };
        let dynamic = self.config_manager.config().clone();
        if dynamic.smart_hvac_mode.active_mode() != Some(mode) {
            info!("season changed during activation of episode {episode}");
            self.deactivate_algorithm(host).await;
            return;
        }

        self.state.update_all_zones(host, now).await;
        let triggers = self.state.zones_needing(mode, dynamic.temp_tolerance);
        let positions =
            self.decision
                .calculate_damper_positions(&self.state, &triggers, mode, &dynamic);
        info!(
            "episode {episode}: {} for {triggers:?}, dampers {positions:?}",
            mode.as_str()
        );
        self.executor
            .set_damper_positions(host, &mut self.state, &positions)
            .await;

        self.phase = Phase::Active { mode, episode };
        self.monitor.start_monitoring(now);
    }

    pub async fn set_enabled<H: HomeAssistant>(&mut self, host: &H, enabled: bool) {
        let value = self.config_manager.set_enabled(enabled);
        self.write_through(host, ConfigKey::Enabled, &value).await;
        info!("controller {}", if enabled { "enabled" } else { "disabled" });

        if !enabled && self.phase != Phase::Idle {
            self.deactivate_algorithm(host).await;
        }
    }

    pub async fn set_temp_tolerance<H: HomeAssistant>(
        &mut self,
        host: &H,
        tolerance: f32,
    ) -> f32 {
        let value = self.config_manager.set_temp_tolerance(tolerance);
        self.write_through(host, ConfigKey::TempTolerance, &value).await;
        self.config_manager.config().temp_tolerance
    }

    pub async fn set_smart_hvac_mode<H: HomeAssistant>(&mut self, host: &H, mode: SeasonalMode) {
        let value = self.config_manager.set_smart_hvac_mode(mode);
        self.write_through(host, ConfigKey::SmartHvacMode, &value).await;
        info!("seasonal mode set to {}", mode.as_str());

        if let Some(running) = self.phase.mode() {
            if mode.active_mode() != Some(running) {
                self.deactivate_algorithm(host).await;
            }
        }
    }

    async fn write_through<H: HomeAssistant>(&self, host: &H, key: ConfigKey, value: &ConfigValue) {
        if let Some(entity) = self.config_manager.entity_for(key) {
            self.executor.write_config_value(host, entity, value).await;
        }
    }

    pub fn status(&self, now: NaiveDateTime) -> ControllerStatus {
        let dynamic = self.config_manager.config();
        let zone_states = self
            .state
            .zones()
            .iter()
            .map(|(name, zone)| {
                let status = ZoneStatus {
                    current_temp: zone.current_temp,
                    target_temp: zone.target_temp,
                    is_active: zone.is_active,
                    isolation: zone.isolation,
                    damper_position: zone.damper_position,
                    temperature_stable: self.state.is_temperature_stable(
                        name,
                        self.config.stability_check_minutes,
                        self.config.stability_threshold,
                        now,
                    ),
                };
                (name.clone(), status)
            })
            .collect();

        let algorithm_mode = match self.phase {
            Phase::Active { mode, .. } => Some(mode.as_str()),
            Phase::Idle | Phase::Activating { .. } | Phase::Deactivating => None,
        };

        ControllerStatus {
            enabled: dynamic.enabled,
            algorithm_active: matches!(self.phase, Phase::Active { .. }),
            activating: matches!(self.phase, Phase::Activating { .. }),
            current_hvac_mode: self.state.current_hvac_mode().to_string(),
            smart_hvac_mode: dynamic.smart_hvac_mode.as_str(),
            algorithm_mode,
            active_zones: self.state.get_active_zones().into_iter().collect(),
            last_check: self
                .last_check
                .map(|at| at.format("%Y-%m-%dT%H:%M:%S").to_string()),
            zone_states,
        }
    }

    /// Mirrors the status into sensor entities for dashboards.
    pub async fn publish_status<H: HomeAssistant>(&self, host: &H, now: NaiveDateTime) {
        let status = self.status(now);
        let on_off = |flag: bool| if flag { "on" } else { "off" };

        let updates = [
            (ENABLED_SENSOR, on_off(status.enabled).to_string(), json!({})),
            (
                ALGORITHM_ACTIVE_SENSOR,
                on_off(status.algorithm_active).to_string(),
                json!({ "mode": status.algorithm_mode, "activating": status.activating }),
            ),
            (
                HVAC_MODE_SENSOR,
                status.current_hvac_mode.clone(),
                json!({ "smart_hvac_mode": status.smart_hvac_mode }),
            ),
            (
                ACTIVE_ZONES_SENSOR,
                status.active_zones.len().to_string(),
                json!({
                    "zones": status.active_zones,
                    "zone_states": status.zone_states,
                    "last_check": status.last_check,
                }),
            ),
        ];

        for (entity, state, attributes) in updates {
            if let Err(err) = host.set_state(entity, &state, attributes).await {
                warn!("failed to publish {entity}: {err}");
            }
        }
    }
}
