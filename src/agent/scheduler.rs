//! Autopilot due-check scheduler.
//!
//! A fixed-period loop compares each enabled autopilot's time since its last
//! firing against its cadence interval. The comparison is against elapsed
//! wall-clock time, not tick boundaries, so an autopilot never fires twice
//! within one interval and a stalled loop fires it once when it wakes rather
//! than catching up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::engine::{RunEngine, StartOptions};
use super::models::{Autopilot, AutopilotFiring, Cadence, Run, now_ms};
use super::registry::RunRegistry;
use crate::agent_config::SchedulerSection;
use crate::errors::AgentError;

/// Creator recorded on runs started by a firing.
pub const AUTOPILOT_CREATOR: &str = "autopilot";

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum time between two firings of one autopilot.
pub fn cadence_interval(cadence: &Cadence, accelerated: bool) -> Duration {
    if accelerated {
        return match cadence {
            Cadence::Hourly { .. } => Duration::from_secs(20),
            Cadence::Custom { every_minutes, .. } => {
                Duration::from_secs((u64::from(*every_minutes) * 5).max(10))
            }
            _ => Duration::from_secs(60),
        };
    }
    match cadence {
        Cadence::Hourly { .. } => HOUR,
        Cadence::Daily { .. } | Cadence::Weekday { .. } => DAY,
        Cadence::Weekly { .. } => DAY * 7,
        Cadence::Custom { every_minutes, .. } => Duration::from_secs(u64::from(*every_minutes) * 60),
    }
}

/// Whether a full interval has elapsed since `last_run_at` (never fired counts as due).
pub fn is_due(autopilot: &Autopilot, now_ms: i64, accelerated: bool) -> bool {
    let interval_ms = cadence_interval(&autopilot.cadence, accelerated).as_millis() as i64;
    now_ms.saturating_sub(autopilot.last_run_at.unwrap_or(0)) >= interval_ms
}

/// Starts the run for a due autopilot.
#[async_trait]
pub trait AutopilotDispatch: Send + Sync {
    async fn dispatch(&self, autopilot: &Autopilot) -> Result<Run, AgentError>;
}

#[async_trait]
impl AutopilotDispatch for RunEngine {
    async fn dispatch(&self, autopilot: &Autopilot) -> Result<Run, AgentError> {
        self.start(
            autopilot.to_command(),
            StartOptions {
                autopilot_id: Some(autopilot.id.clone()),
                created_by: Some(AUTOPILOT_CREATOR.to_string()),
            },
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub accelerated: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        let tick = if section.accelerated {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(section.tick_secs.max(1))
        };
        Self {
            tick,
            accelerated: section.accelerated,
        }
    }
}

pub struct AutopilotScheduler {
    registry: Arc<RunRegistry>,
    dispatcher: Arc<dyn AutopilotDispatch>,
    config: SchedulerConfig,
}

impl AutopilotScheduler {
    pub fn new(
        registry: Arc<RunRegistry>,
        dispatcher: Arc<dyn AutopilotDispatch>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// One due check at `now`. Returns the firings that started a run.
    ///
    /// A failed dispatch still stamps `last_run_at` (without a history entry)
    /// so a broken autopilot waits a full interval instead of retrying every tick.
    pub async fn tick_at(&self, now: i64) -> Vec<AutopilotFiring> {
        let due: Vec<Autopilot> = self
            .registry
            .list_autopilots()
            .into_iter()
            .filter(|a| a.enabled && is_due(a, now, self.config.accelerated))
            .collect();

        let mut fired = Vec::new();
        for autopilot in due {
            match self.dispatcher.dispatch(&autopilot).await {
                Ok(run) => {
                    tracing::info!(
                        autopilot_id = %autopilot.id,
                        run_id = %run.id,
                        cadence = autopilot.cadence.kind(),
                        "autopilot fired"
                    );
                    self.registry.record_firing(&autopilot.id, Some(&run.id), now);
                    fired.push(AutopilotFiring {
                        run_id: run.id,
                        at: now,
                    });
                }
                Err(e) => {
                    tracing::warn!(autopilot_id = %autopilot.id, error = %e, "autopilot dispatch failed");
                    self.registry.record_firing(&autopilot.id, None, now);
                }
            }
        }
        fired
    }

    /// Fire one autopilot immediately, regardless of cadence or enablement.
    pub async fn fire_now(&self, id: &str) -> Result<Run, AgentError> {
        let autopilot = self
            .registry
            .get_autopilot(id)
            .ok_or_else(|| AgentError::AutopilotNotFound { id: id.to_string() })?;
        let run = self.dispatcher.dispatch(&autopilot).await?;
        self.registry.record_firing(id, Some(&run.id), now_ms());
        tracing::info!(autopilot_id = %id, run_id = %run.id, "autopilot fired manually");
        Ok(run)
    }

    /// Run the due-check loop until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(tick = ?self.config.tick, accelerated = self.config.accelerated, "autopilot scheduler started");
            loop {
                interval.tick().await;
                self.tick_at(now_ms()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::approval::ApprovalPolicies;
    use crate::agent::engine::EngineTiming;
    use crate::agent::models::{Container, Delivery, NewAutopilot, OutputFormat};
    use crate::agent::planner::Planner;
    use crate::agent::registry::NewRun;
    use crate::agent::test_support::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINUTE_MS: i64 = 60 * 1000;
    const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

    /// Creates a bare run per dispatch, or fails every time.
    struct FakeDispatch {
        registry: Arc<RunRegistry>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AutopilotDispatch for FakeDispatch {
        async fn dispatch(&self, autopilot: &Autopilot) -> Result<Run, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AgentError::Validation("destination unavailable".into()));
            }
            Ok(self.registry.create_run(NewRun {
                title: autopilot.title.clone(),
                created_by: AUTOPILOT_CREATOR.into(),
                container: autopilot.destination.clone(),
                autopilot_id: Some(autopilot.id.clone()),
            }))
        }
    }

    fn setup(fail: bool) -> (AutopilotScheduler, Arc<RunRegistry>, Arc<FakeDispatch>) {
        let registry = Arc::new(RunRegistry::new(Arc::new(RecordingSink::default())));
        let dispatch = Arc::new(FakeDispatch {
            registry: registry.clone(),
            fail,
            calls: AtomicUsize::new(0),
        });
        let scheduler = AutopilotScheduler::new(
            registry.clone(),
            dispatch.clone(),
            SchedulerConfig::default(),
        );
        (scheduler, registry, dispatch)
    }

    fn draft(cadence: Cadence, last_run_at: Option<i64>) -> NewAutopilot {
        NewAutopilot {
            title: "Weekly digest".into(),
            instruction: "Summarize last week in #general".into(),
            cadence,
            destination: Container::channel("general"),
            scope: Default::default(),
            tools: Default::default(),
            output_format: OutputFormat::Brief,
            delivery: Delivery::default(),
            history: vec![],
            last_run_at,
        }
    }

    fn weekly() -> Cadence {
        Cadence::Weekly {
            hour: 9,
            minute: 0,
            dow: vec![1],
            tz: "UTC".into(),
        }
    }

    fn custom(every_minutes: u32) -> Cadence {
        Cadence::Custom {
            every_minutes,
            tz: "UTC".into(),
        }
    }

    #[test]
    fn test_cadence_intervals() {
        let tz = || "UTC".to_string();
        assert_eq!(cadence_interval(&Cadence::Hourly { minute: 0, tz: tz() }, false), HOUR);
        assert_eq!(
            cadence_interval(&Cadence::Daily { hour: 9, minute: 0, tz: tz() }, false),
            DAY
        );
        assert_eq!(
            cadence_interval(
                &Cadence::Weekday { hour: 9, minute: 0, dow: vec![1, 2, 3, 4, 5], tz: tz() },
                false
            ),
            DAY
        );
        assert_eq!(cadence_interval(&weekly(), false), DAY * 7);
        assert_eq!(cadence_interval(&custom(15), false), Duration::from_secs(900));
    }

    #[test]
    fn test_accelerated_intervals() {
        assert_eq!(
            cadence_interval(&Cadence::Hourly { minute: 0, tz: "UTC".into() }, true),
            Duration::from_secs(20)
        );
        assert_eq!(cadence_interval(&custom(1), true), Duration::from_secs(10));
        assert_eq!(cadence_interval(&custom(4), true), Duration::from_secs(20));
        assert_eq!(cadence_interval(&weekly(), true), Duration::from_secs(60));
        assert_eq!(
            SchedulerConfig::from(&SchedulerSection {
                tick_secs: 30,
                accelerated: true
            })
            .tick,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_weekly_due_after_seven_days_not_six() {
        let now = 100 * DAY_MS;
        let six = draft(weekly(), Some(now - 6 * DAY_MS)).into_autopilot("a".into());
        let seven = draft(weekly(), Some(now - 7 * DAY_MS)).into_autopilot("b".into());
        assert!(!is_due(&six, now, false));
        assert!(is_due(&seven, now, false));
    }

    #[test]
    fn test_never_fired_is_due() {
        let autopilot = draft(weekly(), None).into_autopilot("a".into());
        assert!(is_due(&autopilot, 1, false));
    }

    #[test]
    fn test_extreme_last_run_at_does_not_overflow() {
        let ancient = draft(weekly(), Some(i64::MIN)).into_autopilot("a".into());
        assert!(is_due(&ancient, 50 * DAY_MS, false));
        let future = draft(weekly(), Some(i64::MAX)).into_autopilot("b".into());
        assert!(!is_due(&future, i64::MIN, false));
    }

    #[tokio::test]
    async fn test_negative_last_run_at_is_rejected_before_any_tick() {
        let (scheduler, registry, dispatch) = setup(false);
        let err = registry
            .create_autopilot(draft(weekly(), Some(i64::MIN)))
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert!(registry.list_autopilots().is_empty());
        assert!(scheduler.tick_at(50 * DAY_MS).await.is_empty());
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fires_once_per_interval_regardless_of_tick_rate() {
        let (scheduler, registry, dispatch) = setup(false);
        let t = 10 * DAY_MS;
        let ap = registry.create_autopilot(draft(custom(10), Some(t))).unwrap();

        // Ticks every minute: nothing before the deadline.
        for minute in 1..10 {
            assert!(scheduler.tick_at(t + minute * MINUTE_MS).await.is_empty());
        }
        let fired = scheduler.tick_at(t + 10 * MINUTE_MS).await;
        assert_eq!(fired.len(), 1);
        assert!(scheduler.tick_at(t + 10 * MINUTE_MS + 1).await.is_empty());
        assert!(scheduler.tick_at(t + 19 * MINUTE_MS).await.is_empty());

        let stored = registry.get_autopilot(&ap.id).unwrap();
        assert_eq!(stored.last_run_at, Some(t + 10 * MINUTE_MS));
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history[0].run_id, fired[0].run_id);
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 1);

        let run = registry.get_run(&fired[0].run_id).unwrap();
        assert_eq!(run.autopilot_id.as_deref(), Some(ap.id.as_str()));
    }

    #[tokio::test]
    async fn test_missed_ticks_fire_exactly_once() {
        let (scheduler, registry, _) = setup(false);
        let t = 10 * DAY_MS;
        let ap = registry.create_autopilot(draft(custom(10), Some(t))).unwrap();

        // The loop stalled for three and a half intervals.
        let late = t + 35 * MINUTE_MS;
        assert_eq!(scheduler.tick_at(late).await.len(), 1);
        assert!(scheduler.tick_at(late + MINUTE_MS).await.is_empty());
        assert_eq!(registry.get_autopilot(&ap.id).unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_autopilots_are_skipped() {
        let (scheduler, registry, dispatch) = setup(false);
        let ap = registry.create_autopilot(draft(weekly(), None)).unwrap();
        registry
            .patch_autopilot(
                &ap.id,
                crate::agent::models::AutopilotPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(scheduler.tick_at(50 * DAY_MS).await.is_empty());
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_stamps_without_history() {
        let (scheduler, registry, dispatch) = setup(true);
        let ap = registry.create_autopilot(draft(weekly(), None)).unwrap();
        let now = 50 * DAY_MS;
        assert!(scheduler.tick_at(now).await.is_empty());
        assert!(scheduler.tick_at(now + MINUTE_MS).await.is_empty());

        let stored = registry.get_autopilot(&ap.id).unwrap();
        assert_eq!(stored.last_run_at, Some(now));
        assert!(stored.history.is_empty());
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fire_now() {
        let (scheduler, registry, _) = setup(false);
        let ap = registry.create_autopilot(draft(weekly(), Some(now_ms()))).unwrap();
        let run = scheduler.fire_now(&ap.id).await.unwrap();
        assert_eq!(run.autopilot_id.as_deref(), Some(ap.id.as_str()));
        assert_eq!(registry.get_autopilot(&ap.id).unwrap().history.len(), 1);

        assert!(matches!(
            scheduler.fire_now("ghost").await,
            Err(AgentError::AutopilotNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_dispatch_starts_unapproved_run() {
        let registry = Arc::new(RunRegistry::new(Arc::new(RecordingSink::default())));
        let engine = RunEngine::new(
            registry.clone(),
            Planner::offline(),
            ApprovalPolicies::default(),
            EngineTiming::default(),
        );
        let scheduler = Arc::new(AutopilotScheduler::new(
            registry.clone(),
            Arc::new(engine),
            SchedulerConfig::default(),
        ));
        let ap = registry.create_autopilot(draft(weekly(), None)).unwrap();

        let handle = scheduler.clone().spawn();
        tokio::time::sleep(Duration::from_secs(120)).await;
        handle.abort();

        let stored = registry.get_autopilot(&ap.id).unwrap();
        assert_eq!(stored.history.len(), 1);
        let run = registry.get_run(&stored.history[0].run_id).unwrap();
        assert_eq!(run.autopilot_id.as_deref(), Some(ap.id.as_str()));
        assert_eq!(run.created_by, AUTOPILOT_CREATOR);
        assert!(!run.approval.required);
        assert_eq!(run.status, crate::agent::models::RunStatus::Completed);
    }
}
