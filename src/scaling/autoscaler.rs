//! Autoscaler — one goal-seeking control loop per function
//!
//! Grow is immediate: raising the goal wakes the loop, which asks the
//! orchestrator for the new size and keeps confirming until the reported size
//! reaches the goal. Shrink is slow: the loop first waits a relax interval
//! with no growth, then walks the goal down one replica per step interval.
//! Any growth seen while waiting aborts the shrink.
//!
//! The goal lives in the function runtime under the scaler lock; every goal
//! mutation signals the runtime's wake handle while holding that lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::{GateError, Result};
use crate::registry::{FunctionRuntime, ScalerState};
use crate::scaling::orchestrator::{Orchestrator, ScaleDecision, ScaleDirection};

/// Re-check interval while the orchestrator has not caught up with a grow
const CONFIRM_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns and drives per-function scaling loops
pub struct Autoscaler {
    orchestrator: Arc<dyn Orchestrator>,
    settings: Arc<Settings>,
}

impl Autoscaler {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, settings: Arc<Settings>) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// Replicas needed for the observed load.
    ///
    /// `desired = ceil(in_flight / target_concurrency)`, 0 when idle.
    pub fn compute_desired_replicas(in_flight: u64, target_concurrency: u32) -> u32 {
        if in_flight == 0 {
            return 0;
        }
        let target = target_concurrency.max(1) as u64;
        in_flight.div_ceil(target).min(u32::MAX as u64) as u32
    }

    /// Raise the goal to cover the function's current in-flight load
    pub fn observe_load(self: &Arc<Self>, rt: &Arc<FunctionRuntime>) {
        let desired =
            Self::compute_desired_replicas(rt.in_flight(), self.settings.target_concurrency());
        if desired > 0 {
            self.request_goal(rt, desired);
        }
    }

    /// Request a grow. Lower or equal goals are ignored; goals above the
    /// replica ceiling are clamped. Returns the resulting goal, 0 once the
    /// runtime is retired.
    pub fn request_goal(self: &Arc<Self>, rt: &Arc<FunctionRuntime>, goal: u32) -> u32 {
        let max = self.settings.max_replicas();
        let mut state = rt.scaler.lock().unwrap();
        if state.retired {
            return 0;
        }
        if goal <= state.goal {
            return state.goal;
        }

        let goal = if goal > max {
            tracing::warn!(
                cookie = rt.cookie(),
                requested = goal,
                max,
                "Replica goal above ceiling, excess rejected"
            );
            max
        } else {
            goal
        };
        if goal <= state.goal {
            return state.goal;
        }

        state.goal = goal;
        self.wake(rt, &mut state);
        goal
    }

    /// Set the configured replica floor and make sure the goal covers it
    pub fn start(self: &Arc<Self>, rt: &Arc<FunctionRuntime>, floor: u32) {
        let floor = floor.min(self.settings.max_replicas());
        let mut state = rt.scaler.lock().unwrap();
        if state.retired {
            return;
        }
        state.floor = floor;
        if state.goal < floor {
            state.goal = floor;
        }
        if state.goal > 0 {
            self.wake(rt, &mut state);
        }
    }

    /// Drop the goal to 0; the loop notices and exits
    pub fn stop(&self, rt: &FunctionRuntime) {
        let mut state = rt.scaler.lock().unwrap();
        state.goal = 0;
        state.floor = 0;
        rt.wakeup.notify_one();
    }

    /// Stop for good: the runtime is being evicted and must never scale again
    pub fn retire(&self, rt: &FunctionRuntime) {
        let mut state = rt.scaler.lock().unwrap();
        state.retired = true;
        state.goal = 0;
        state.floor = 0;
        rt.wakeup.notify_one();
    }

    /// Signal the running loop, or spawn one. Caller holds the scaler lock.
    fn wake(self: &Arc<Self>, rt: &Arc<FunctionRuntime>, state: &mut ScalerState) {
        if state.running {
            rt.wakeup.notify_one();
        } else {
            state.running = true;
            tokio::spawn(self.clone().run(rt.clone()));
        }
    }

    /// Current goal, or `None` after marking the loop stopped when it is 0
    fn goal_or_exit(rt: &FunctionRuntime) -> Option<u32> {
        let mut state = rt.scaler.lock().unwrap();
        if state.goal == 0 {
            state.running = false;
            None
        } else {
            Some(state.goal)
        }
    }

    async fn run(self: Arc<Self>, rt: Arc<FunctionRuntime>) {
        tracing::debug!(cookie = rt.cookie(), "Scaling loop started");
        // Last size reported by the orchestrator
        let mut current: u32 = 0;

        'outer: loop {
            let Some(goal) = Self::goal_or_exit(&rt) else {
                break;
            };

            if goal > current {
                match self.scale_to(&rt, goal, ScaleDirection::Up).await {
                    Ok(actual) => current = actual,
                    Err(e) => {
                        tracing::warn!(cookie = rt.cookie(), error = %e, "Scale up failed, retrying");
                        wait_for(&rt, self.settings.step_interval(), |s| s.goal == 0).await;
                        continue;
                    }
                }
                if current < goal {
                    wait_for(&rt, CONFIRM_INTERVAL, |s| s.goal == 0).await;
                }
                // Goal may have risen again mid-scale
                continue;
            }

            let reached = current;
            if wait_for(&rt, self.settings.relax_interval(), |s| {
                s.goal == 0 || s.goal > reached
            })
            .await
            {
                continue;
            }

            if self.reconcile(&rt, &mut current).await {
                continue;
            }

            loop {
                let next = {
                    let mut state = rt.scaler.lock().unwrap();
                    if state.goal == 0 || state.goal > current {
                        continue 'outer;
                    }
                    let busy = Self::compute_desired_replicas(
                        rt.in_flight(),
                        self.settings.target_concurrency(),
                    );
                    let floor = state.floor.max(busy).max(1);
                    if current <= floor {
                        state.goal = current;
                        continue 'outer;
                    }
                    state.goal = current - 1;
                    state.goal
                };

                if wait_for(&rt, self.settings.step_interval(), |s| {
                    s.goal == 0 || s.goal > next
                })
                .await
                {
                    continue 'outer;
                }

                match self.scale_to(&rt, next, ScaleDirection::Down).await {
                    Ok(actual) => current = actual,
                    Err(e) => {
                        tracing::warn!(cookie = rt.cookie(), error = %e, "Scale down failed, retrying");
                        continue 'outer;
                    }
                }
            }
        }

        tracing::debug!(cookie = rt.cookie(), "Scaling loop stopped");
    }

    /// Treat the orchestrator's reported size as authoritative. Returns true
    /// when it differed from ours.
    async fn reconcile(&self, rt: &FunctionRuntime, current: &mut u32) -> bool {
        let deployment = rt.run_deployment().name();
        let status = match self.orchestrator.status(&deployment).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(deployment = %deployment, error = %e, "Status query failed");
                return false;
            }
        };
        if status.replicas == *current {
            return false;
        }

        tracing::info!(
            deployment = %deployment,
            expected = *current,
            reported = status.replicas,
            "Replica count changed outside the scaling loop"
        );
        *current = status.replicas;
        let mut state = rt.scaler.lock().unwrap();
        if state.goal > 0 && status.replicas > state.goal {
            state.goal = status.replicas.min(self.settings.max_replicas());
        }
        true
    }

    async fn scale_to(
        &self,
        rt: &FunctionRuntime,
        replicas: u32,
        direction: ScaleDirection,
    ) -> Result<u32> {
        let decision = ScaleDecision {
            deployment: rt.run_deployment().name(),
            direction,
            replicas,
            reason: format!("{}: in_flight={}, goal={}", direction, rt.in_flight(), replicas),
        };
        tracing::info!(
            deployment = decision.deployment,
            direction = %decision.direction,
            replicas = decision.replicas,
            reason = decision.reason,
            "Autoscaler decision"
        );

        let result = self.orchestrator.scale(&decision).await?;
        if !result.accepted {
            return Err(GateError::Orchestrator(format!(
                "scale of '{}' to {} rejected: {}",
                decision.deployment, replicas, result.message
            )));
        }
        Ok(result.actual_replicas)
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }
}

/// Wait until `changed` holds or `period` elapses. Wakeups that leave the
/// state unchanged keep waiting toward the same deadline.
async fn wait_for<F>(rt: &FunctionRuntime, period: Duration, changed: F) -> bool
where
    F: Fn(&ScalerState) -> bool,
{
    let deadline = Instant::now() + period;
    loop {
        let hit = {
            let state = rt.scaler.lock().unwrap();
            changed(&state)
        };
        if hit {
            return true;
        }
        if tokio::time::timeout_at(deadline, rt.wakeup.notified())
            .await
            .is_err()
        {
            let state = rt.scaler.lock().unwrap();
            return changed(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionRecord, FunctionSize, FunctionState, OwnerId, TenantRuntime};
    use crate::scaling::orchestrator::{DeploymentSpec, MockOrchestrator};
    use crate::stats::FnStats;
    use tokio::time::sleep;

    struct Fixture {
        scaler: Arc<Autoscaler>,
        mock: Arc<MockOrchestrator>,
        rt: Arc<FunctionRuntime>,
        settings: Arc<Settings>,
        deployment: String,
    }

    async fn fixture() -> Fixture {
        let id = OwnerId::new("t", "p", "f");
        let record = FunctionRecord {
            cookie: id.cookie(),
            id,
            lang: "python".to_string(),
            state: FunctionState::Ready,
            size: FunctionSize::default(),
            replicas: 1,
            version: "v1".to_string(),
            run_version: None,
            auth_ctx: None,
            deactivated_from: None,
            created_at: chrono::Utc::now(),
        };
        let key = record.run_deployment();
        let mock = Arc::new(MockOrchestrator::new());
        mock.run_deployment(&DeploymentSpec::new(&key, "python", 0, &FunctionSize::default()))
            .await
            .unwrap();

        let settings = Arc::new(Settings::default());
        let stats = Arc::new(FnStats::new(record.cookie.clone()));
        let tenant = Arc::new(TenantRuntime::new("t", 0, 0));
        let rt = Arc::new(FunctionRuntime::new(record, tenant, stats, (0, 0)));
        let scaler = Arc::new(Autoscaler::new(mock.clone(), settings.clone()));
        Fixture {
            scaler,
            mock,
            rt,
            settings,
            deployment: key.name(),
        }
    }

    #[test]
    fn test_formula_basic() {
        assert_eq!(Autoscaler::compute_desired_replicas(0, 1), 0);
        assert_eq!(Autoscaler::compute_desired_replicas(1, 1), 1);
        assert_eq!(Autoscaler::compute_desired_replicas(7, 1), 7);
    }

    #[test]
    fn test_formula_rounds_up() {
        assert_eq!(Autoscaler::compute_desired_replicas(5, 2), 3);
        assert_eq!(Autoscaler::compute_desired_replicas(4, 2), 2);
        // Zero target treated as 1
        assert_eq!(Autoscaler::compute_desired_replicas(3, 0), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grow_then_gradual_shrink() {
        let f = fixture().await;
        f.scaler.request_goal(&f.rt, 5);
        f.scaler.request_goal(&f.rt, 3);

        sleep(Duration::from_secs(29)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5]);

        // relax (30s) + one step (5s)
        sleep(Duration::from_secs(7)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4]);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4]);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4, 3]);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4, 3, 2, 1]);
        let state = f.rt.scaler_state();
        assert_eq!(state.goal, 1);
        assert!(state.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_growth_aborts_shrink() {
        let f = fixture().await;
        f.scaler.request_goal(&f.rt, 5);
        sleep(Duration::from_secs(36)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4]);

        f.scaler.request_goal(&f.rt, 5);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4, 5]);

        // A full relax interval must pass again before shrinking
        sleep(Duration::from_secs(29)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_goal_clamped_to_ceiling() {
        let f = fixture().await;
        f.settings.set("fn_replicas_limit", 2).unwrap();

        assert_eq!(f.scaler.request_goal(&f.rt, 4), 2);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![2]);
        assert!(f.mock.decisions().iter().all(|d| d.replicas <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_exits_loop_and_restart() {
        let f = fixture().await;
        f.scaler.request_goal(&f.rt, 3);
        sleep(Duration::from_secs(1)).await;
        assert!(f.rt.scaler_state().running);

        f.scaler.stop(&f.rt);
        sleep(Duration::from_millis(10)).await;
        let state = f.rt.scaler_state();
        assert_eq!(state.goal, 0);
        assert!(!state.running);

        f.scaler.request_goal(&f.rt, 2);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_runtime_refuses_goals() {
        let f = fixture().await;
        f.scaler.request_goal(&f.rt, 2);
        sleep(Duration::from_secs(1)).await;

        f.scaler.retire(&f.rt);
        sleep(Duration::from_millis(10)).await;
        assert!(!f.rt.scaler_state().running);

        f.rt.inc_in_flight();
        f.scaler.observe_load(&f.rt);
        assert_eq!(f.scaler.request_goal(&f.rt, 3), 0);
        f.scaler.start(&f.rt, 1);
        sleep(Duration::from_secs(60)).await;

        let state = f.rt.scaler_state();
        assert!(state.retired);
        assert_eq!((state.goal, state.floor), (0, 0));
        assert!(!state.running);
        assert_eq!(f.mock.history(&f.deployment), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_floor_holds_shrink() {
        let f = fixture().await;
        f.scaler.start(&f.rt, 2);
        f.scaler.request_goal(&f.rt, 4);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(f.mock.history(&f.deployment).last(), Some(&2));
        assert_eq!(f.rt.scaler_state().goal, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_load_holds_shrink() {
        let f = fixture().await;
        for _ in 0..3 {
            f.rt.inc_in_flight();
        }
        f.scaler.request_goal(&f.rt, 5);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![5, 4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_load_grows_goal() {
        let f = fixture().await;
        f.rt.inc_in_flight();
        f.rt.inc_in_flight();
        f.scaler.observe_load(&f.rt);
        assert_eq!(f.rt.scaler_state().goal, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestrator_failure_retried() {
        let f = fixture().await;
        f.mock.set_failing(true);
        f.scaler.request_goal(&f.rt, 2);
        sleep(Duration::from_secs(1)).await;
        assert!(f.mock.decisions().is_empty());

        f.mock.set_failing(false);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_shrink_is_regrown() {
        let f = fixture().await;
        f.scaler.request_goal(&f.rt, 3);
        sleep(Duration::from_secs(1)).await;

        // Someone else scaled the deployment down
        f.mock.set_replicas(&f.deployment, 1);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(f.mock.history(&f.deployment), vec![3, 3]);
    }
}
