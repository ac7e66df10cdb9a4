// Scheduler control loop

//! # Scheduler Control Loop
//!
//! One long-running loop per scheduler process. Several processes may run
//! against the same state store; they coordinate only through conditional
//! updates and the named mutexes.
//!
//! Each tick multiplexes three tasks, each paced by its own counter:
//!
//! | Task | Default pace | Guard |
//! |---|---|---|
//! | promote QUEUED → PENDING and submit | every tick | `START_ENGINE_TASK` around admission and submission |
//! | reconcile stale PENDING actions | every 30 ticks | conditional updates |
//! | terminate one idle host | every 600 ticks | `SCALE_DOWN` |
//!
//! A failure while handling one action is logged and the loop moves on to the
//! next one. Nothing here stops the loop except the shutdown signal.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::batch::BatchExecutor;
use super::capacity::{select_host_to_terminate, CapacityManager};
use super::dag::{DagBuilder, WorkflowAttributes};
use super::mutex::MutexService;
use super::storage::{retry_conditional, transition_action, ActionFilter, StateStore};
use super::triggers::TriggerProxy;
use crate::config::SchedulerSettings;
use crate::models::{Action, ActionState, Mutexes};
use crate::{Result, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerTask {
    TransitionQueued,
    TransitionStale,
    ScaleDown,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    current: u32,
    threshold: u32,
}

/// Per-task tick counters
///
/// Every tick bumps all counters. A task is ready once its counter exceeds
/// its threshold; checking readiness resets the counter.
#[derive(Debug, Clone)]
pub struct TickCounter {
    counters: HashMap<SchedulerTask, Counter>,
}

impl TickCounter {
    pub fn new(settings: &SchedulerSettings) -> Self {
        let counters = [
            (SchedulerTask::TransitionQueued, settings.transition_queued_threshold),
            (SchedulerTask::TransitionStale, settings.transition_stale_threshold),
            (SchedulerTask::ScaleDown, settings.scale_down_threshold),
        ]
        .into_iter()
        .map(|(task, threshold)| (task, Counter { current: 0, threshold }))
        .collect();
        Self { counters }
    }

    pub fn tick(&mut self) {
        for counter in self.counters.values_mut() {
            counter.current = counter.current.saturating_add(1);
        }
    }

    pub fn is_ready(&mut self, task: SchedulerTask) -> bool {
        match self.counters.get_mut(&task) {
            Some(counter) if counter.current > counter.threshold => {
                counter.current = 0;
                true
            }
            _ => false,
        }
    }
}

pub struct SchedulerLoop {
    store: Arc<dyn StateStore>,
    dag: Arc<DagBuilder>,
    executor: Arc<dyn BatchExecutor>,
    mutex: MutexService,
    triggers: TriggerProxy,
    capacity: Option<Arc<dyn CapacityManager>>,
    settings: SchedulerSettings,
    notification_target: Option<String>,
    counter: TickCounter,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn StateStore>,
        dag: Arc<DagBuilder>,
        executor: Arc<dyn BatchExecutor>,
        triggers: TriggerProxy,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            mutex: MutexService::new(store.clone()),
            counter: TickCounter::new(&settings),
            store,
            dag,
            executor,
            triggers,
            capacity: None,
            settings,
            notification_target: None,
        }
    }

    /// Enable the scale-down task
    pub fn with_capacity_manager(mut self, capacity: Arc<dyn CapacityManager>) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_notification_target(mut self, target: Option<String>) -> Self {
        self.notification_target = target;
        self
    }

    /// Tick until `shutdown` flips to `true` or its sender goes away
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_millis = self.settings.tick_millis, "🚀 Scheduler loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🛑 Scheduler loop stopped");
    }

    /// One tick: run whichever tasks are due
    pub async fn run_once(&mut self) {
        self.counter.tick();

        if self.counter.is_ready(SchedulerTask::TransitionQueued) {
            if let Err(e) = self.promote_queued_actions().await {
                error!("Error transitioning queued actions: {}", e);
            }
        }
        if self.counter.is_ready(SchedulerTask::TransitionStale) {
            if let Err(e) = self.requeue_stale_pending_actions().await {
                error!("Error reconciling stale actions: {}", e);
            }
        }
        if self.counter.is_ready(SchedulerTask::ScaleDown) {
            if let Err(e) = self.scale_down_idle_capacity().await {
                error!("Error scaling down: {}", e);
            }
        }
    }

    /// Run every task once, ignoring the counters
    pub async fn run_all_tasks(&self) -> Result<()> {
        self.promote_queued_actions().await?;
        self.requeue_stale_pending_actions().await?;
        self.scale_down_idle_capacity().await?;
        Ok(())
    }

    /// Promote every admissible QUEUED action. Returns how many got a job.
    pub async fn promote_queued_actions(&self) -> Result<usize> {
        let queued = self
            .store
            .find_actions(&ActionFilter::with_states(&[ActionState::Queued]))
            .await?;
        debug!(count = queued.len(), "Transitioning queued actions to pending");

        let mut promoted = 0;
        for action in queued {
            match self.promote_action(&action).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) if e.is_conditional_update_failure() => {
                    debug!(action_id = %action.id, "Action already claimed by another scheduler");
                }
                Err(e) => error!(action_id = %action.id, "Error transitioning action to PENDING: {}", e),
            }
        }
        Ok(promoted)
    }

    /// Admission control, claim, then submission of a single action.
    ///
    /// The in-flight count, the QUEUED → PENDING claim and the submission all
    /// run while holding `START_ENGINE_TASK`, so two schedulers cannot both
    /// admit into a datastore's last free slot. `Ok(false)` means the action
    /// was left QUEUED for a later tick.
    pub async fn promote_action(&self, action: &Action) -> Result<bool> {
        let promoted = self
            .mutex
            .with_mutex(Mutexes::START_ENGINE_TASK, || self.admit_and_submit(action))
            .await?;

        match promoted {
            Some(promoted) => Ok(promoted),
            None => {
                debug!(action_id = %action.id, "Engine task mutex busy, leaving action queued");
                Ok(false)
            }
        }
    }

    async fn admit_and_submit(&self, action: &Action) -> Result<bool> {
        let datastore = match self.store.get_datastore(&action.datastore_id).await? {
            Some(datastore) if datastore.is_active() => datastore,
            _ => return Ok(false),
        };

        let in_flight = self
            .store
            .count_actions(&datastore.id, &ActionState::IN_FLIGHT)
            .await?;
        if in_flight >= u64::from(datastore.concurrency) {
            debug!(datastore_id = %datastore.id, "Datastore has reached max concurrency");
            return Ok(false);
        }

        let pending = transition_action(
            self.store.as_ref(),
            action,
            ActionState::Queued,
            ActionState::Pending,
            action.error_message.clone(),
        )
        .await?;

        if let Err(e) = self.dag.engines().get(&pending.engine_name) {
            warn!(action_id = %pending.id, "Failing action with unknown engine: {}", e);
            let failed = transition_action(
                self.store.as_ref(),
                &pending,
                ActionState::Pending,
                ActionState::Failed,
                Some(e.to_string()),
            )
            .await?;
            self.notify_completion(&failed).await;
            return Ok(false);
        }

        let attrs = WorkflowAttributes::from_action(&pending, self.notification_target.clone());
        match self.dag.submit_action(&pending, &attrs).await {
            Ok(job_id) => {
                if let Err(e) = self.record_job_id(&pending.id, &job_id).await {
                    error!(action_id = %pending.id, batch_job_id = %job_id, "Failed to record submitted job: {}", e);
                }
                Ok(true)
            }
            Err(e) => {
                warn!(action_id = %pending.id, "Job submission failed, requeueing: {}", e);
                self.revert_to_queued(&pending).await?;
                Err(e)
            }
        }
    }

    /// Attach the job id to the latest copy of the action.
    ///
    /// The job may already have called back, so only `batch_job_id` is written.
    async fn record_job_id(&self, action_id: &str, job_id: &str) -> Result<Action> {
        retry_conditional(|| async move {
            let mut current = self
                .store
                .get_action(action_id)
                .await?
                .ok_or_else(|| SchedulerError::NotFound(format!("action {}", action_id)))?;
            current.batch_job_id = Some(job_id.to_string());
            self.store.update_action(&current).await
        })
        .await
    }

    async fn revert_to_queued(&self, pending: &Action) -> Result<Action> {
        transition_action(
            self.store.as_ref(),
            pending,
            ActionState::Pending,
            ActionState::Queued,
            pending.error_message.clone(),
        )
        .await
    }

    async fn notify_completion(&self, action: &Action) {
        if let Err(e) = self
            .triggers
            .complete_action(&action.id, action.state, action.error_message.clone())
            .await
        {
            error!(action_id = %action.id, "Failed to send completion notification: {}", e);
        }
    }

    /// Reconcile PENDING actions nobody has heard from in a while.
    /// Returns how many were touched.
    pub async fn requeue_stale_pending_actions(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.settings.stale_after_secs);
        let stale = self.store.find_stale_pending_actions(cutoff).await?;

        let mut reconciled = 0;
        for action in stale {
            match self.reconcile_stale_action(&action).await {
                Ok(_) => reconciled += 1,
                Err(e) if e.is_conditional_update_failure() => {
                    debug!(action_id = %action.id, "Stale action already handled elsewhere");
                }
                Err(e) => error!(action_id = %action.id, "Error reconciling stale action: {}", e),
            }
        }
        Ok(reconciled)
    }

    /// Fail the action if its job failed, otherwise put it back in the queue
    pub async fn reconcile_stale_action(&self, action: &Action) -> Result<ActionState> {
        warn!(action_id = %action.id, batch_job_id = ?action.batch_job_id, "Found stale action");

        let job = match &action.batch_job_id {
            Some(job_id) => self
                .executor
                .describe_jobs(std::slice::from_ref(job_id))
                .await?
                .into_iter()
                .next(),
            None => None,
        };

        match job {
            Some(job) if job.status.to_action_state() == ActionState::Failed => {
                let reason = job
                    .status_reason
                    .unwrap_or_else(|| format!("batch job {} failed", job.job_id));
                let failed = transition_action(
                    self.store.as_ref(),
                    action,
                    ActionState::Pending,
                    ActionState::Failed,
                    Some(reason),
                )
                .await?;
                self.notify_completion(&failed).await;
                Ok(ActionState::Failed)
            }
            _ => {
                self.revert_to_queued(action).await?;
                Ok(ActionState::Queued)
            }
        }
    }

    /// Terminate at most one idle host close to a billing-hour boundary
    pub async fn scale_down_idle_capacity(&self) -> Result<Option<String>> {
        let Some(capacity) = &self.capacity else {
            return Ok(None);
        };
        let window = self.settings.scale_down_window_secs;

        let terminated = self
            .mutex
            .with_mutex(Mutexes::SCALE_DOWN, || async move {
                let hosts = capacity.list_hosts().await?;
                let host_id = match select_host_to_terminate(&hosts, Utc::now(), window) {
                    Some(host) => host.host_id.clone(),
                    None => return Ok::<_, SchedulerError>(None),
                };
                info!(host_id = %host_id, "Terminating idle host");
                capacity.terminate_host(&host_id).await?;
                Ok(Some(host_id))
            })
            .await?;
        Ok(terminated.flatten())
    }
}
