// DAG builder - turns an ordered action list into dependent batch jobs

//! # DAG Builder
//!
//! A workflow instance is an ordered chain of parallel groups:
//!
//! ```text
//!  group 0        group 1          group 2 (sink)
//! [load_a] ──┐  ┌─> [transform_a] ─┐
//!            ├──┤                  ├─> [publish]
//! [load_b] ──┘  └─> [transform_b] ─┘
//! ```
//!
//! Every job of group *i* depends on every job of group *i-1*. The last group
//! must hold exactly one action so there is a single place to report the end
//! of the workflow.
//!
//! Submission is all-or-nothing from the batch service's point of view: if any
//! job fails to submit, every job already submitted for this build is
//! cancelled before the error is returned.
//!
//! ## Rust Learning Notes:
//!
//! ### Observable Counters
//! The grouping fallback is counted with an `AtomicU64` so the builder can be
//! shared behind an `Arc` and still expose how often it happened.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::batch::BatchExecutor;
use super::engines::EngineRegistry;
use super::storage::StateStore;
use crate::models::{Action, EnvVar, JobDefinitionStatus, JobSubmission};
use crate::{Result, SchedulerError};

/// Longest job name the downstream log system accepts
pub const MAX_JOB_NAME_LEN: usize = 50;

/// Name of the structured env variable carrying every job input
pub const INPUT_ENV: &str = "input_env";

const CANCEL_REASON: &str = "Failed to create all jobs in a dag";

/// Where a job sits in the DAG
#[derive(Debug, Clone, Copy)]
struct JobPosition {
    group_idx: usize,
    is_first: bool,
    is_last: bool,
}

/// Attributes shared by every job of one workflow instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowAttributes {
    pub workflow_id: String,
    pub workflow_instance_id: String,
    pub datastore_id: String,
    /// Where jobs publish their completion notice
    pub notification_target: Option<String>,
}

impl WorkflowAttributes {
    /// Attributes as recorded on an instance action
    pub fn from_action(action: &Action, notification_target: Option<String>) -> Self {
        Self {
            workflow_id: action.workflow_id.clone().unwrap_or_default(),
            workflow_instance_id: action.workflow_instance_id.clone().unwrap_or_default(),
            datastore_id: action.datastore_id.clone(),
            notification_target,
        }
    }

    fn to_env_map(&self, retries_on_failures: u32) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("workflow_instance_id".into(), self.workflow_instance_id.clone().into());
        map.insert("retries_on_failures".into(), retries_on_failures.into());
        map.insert("workflow_id".into(), self.workflow_id.clone().into());
        map.insert("datastore_id".into(), self.datastore_id.clone().into());
        map.insert(
            "sns_arn".into(),
            self.notification_target.clone().unwrap_or_default().into(),
        );
        map
    }
}

/// Job name `{workflow_id}_{order_idx}_{action_name}_{suffix}`, restricted to
/// `[A-Za-z0-9_]` and cut to [`MAX_JOB_NAME_LEN`] characters.
pub fn generate_job_name(workflow_id: &str, order_idx: i32, action_name: &str, suffix: &str) -> String {
    let raw = format!(
        "{}_{}_{}_{}",
        workflow_id,
        order_idx,
        action_name.replace('-', "_"),
        suffix
    );
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(MAX_JOB_NAME_LEN)
        .collect()
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten workflow and action attributes into string-valued env entries.
///
/// The batch service only accepts strings: booleans become `"True"` /
/// `"False"`, numbers their decimal form.
pub fn generate_env_vars(
    workflow_attrs: &Map<String, Value>,
    action_attrs: &Map<String, Value>,
    is_first_action: bool,
    is_last_action: bool,
) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = workflow_attrs
        .iter()
        .chain(action_attrs.iter())
        .map(|(name, value)| EnvVar::new(name.clone(), env_value(value)))
        .collect();
    vars.push(EnvVar::new("is_first_action", env_value(&Value::Bool(is_first_action))));
    vars.push(EnvVar::new("is_last_action", env_value(&Value::Bool(is_last_action))));
    vars
}

/// Groups actions and submits them as dependent batch jobs
pub struct DagBuilder {
    store: Arc<dyn StateStore>,
    executor: Arc<dyn BatchExecutor>,
    engines: EngineRegistry,
    job_queue: String,
    job_definition_suffix: String,
    grouping_fallbacks: AtomicU64,
}

impl DagBuilder {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn BatchExecutor>,
        engines: EngineRegistry,
        job_queue: impl Into<String>,
        job_definition_suffix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executor,
            engines,
            job_queue: job_queue.into(),
            job_definition_suffix: job_definition_suffix.into(),
            grouping_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// How many builds fell back to `order_idx` grouping
    pub fn grouping_fallbacks(&self) -> u64 {
        self.grouping_fallbacks.load(Ordering::Relaxed)
    }

    /// Partition actions into consecutive groups that run in parallel.
    ///
    /// Groups by `parallelization_idx` when every action has one, otherwise by
    /// `order_idx`.
    pub fn group_actions(&self, actions: &[Action]) -> Result<Vec<Vec<Action>>> {
        if actions.is_empty() {
            return Err(SchedulerError::Validation(
                "a DAG needs at least one action".to_string(),
            ));
        }

        let with_index = actions
            .iter()
            .filter(|a| a.parallelization_idx.is_some())
            .count();
        let by_parallelization = with_index == actions.len();
        if with_index > 0 && !by_parallelization {
            self.grouping_fallbacks.fetch_add(1, Ordering::Relaxed);
            warn!(
                with_index,
                total = actions.len(),
                "Some actions lack parallelization_idx, grouping by order_idx instead"
            );
        }

        let key = |action: &Action| {
            if by_parallelization {
                action.parallelization_idx.unwrap_or(action.order_idx)
            } else {
                action.order_idx
            }
        };

        let mut groups: Vec<Vec<Action>> = Vec::new();
        let mut current_key = None;
        for action in actions {
            let k = key(action);
            if current_key == Some(k) {
                if let Some(group) = groups.last_mut() {
                    group.push(action.clone());
                    continue;
                }
            }
            groups.push(vec![action.clone()]);
            current_key = Some(k);
        }
        Ok(groups)
    }

    fn job_definition_family(&self, engine_name: &str) -> Result<String> {
        let engine = self.engines.get(engine_name)?;
        if self.job_definition_suffix.is_empty() {
            return Ok(engine.job_definition_name().to_string());
        }
        Ok(format!(
            "{}_{}",
            engine.job_definition_name(),
            self.job_definition_suffix
        ))
    }

    /// Reference of the highest ACTIVE revision for an engine's job definition
    pub async fn resolve_job_definition(&self, engine_name: &str) -> Result<String> {
        let family = self.job_definition_family(engine_name)?;
        let definitions = self
            .executor
            .describe_job_definitions(&family, JobDefinitionStatus::Active)
            .await?;

        let latest = definitions
            .into_iter()
            .max_by_key(|d| d.revision)
            .ok_or_else(|| {
                SchedulerError::NoJobDefinition(format!(
                    "no ACTIVE job definition named {} for engine {}",
                    family, engine_name
                ))
            })?;
        info!(job_definition = %latest.job_definition_arn, revision = latest.revision, "Resolved job definition");
        Ok(latest.job_definition_arn)
    }

    fn job_environment(
        &self,
        action: &Action,
        attrs: &WorkflowAttributes,
        retries_on_failures: u32,
        position: JobPosition,
    ) -> Result<Vec<EnvVar>> {
        let group_idx = position.group_idx;
        let mut action_attrs = Map::new();
        action_attrs.insert("is_continue_on_failure".into(), action.is_continue_on_failure().into());
        action_attrs.insert(
            "current_step_id".into(),
            action.workflow_action_id.clone().unwrap_or_else(|| action.id.clone()).into(),
        );
        action_attrs.insert(
            "output_key".into(),
            format!("{}_{}.dat", attrs.workflow_instance_id, group_idx).into(),
        );
        if group_idx > 0 {
            action_attrs.insert(
                "input_key".into(),
                format!("{}_{}.dat", attrs.workflow_instance_id, group_idx - 1).into(),
            );
        }
        action_attrs.insert("ACTION_ID".into(), action.id.clone().into());

        let vars = generate_env_vars(
            &attrs.to_env_map(retries_on_failures),
            &action_attrs,
            position.is_first,
            position.is_last,
        );
        Ok(vec![
            EnvVar::new(INPUT_ENV, serde_json::to_string(&vars)?),
            EnvVar::new("ACTION_ID", action.id.clone()),
        ])
    }

    async fn submission_for(
        &self,
        action: &Action,
        attrs: &WorkflowAttributes,
        retries_on_failures: u32,
        position: JobPosition,
        depends_on: Vec<String>,
    ) -> Result<JobSubmission> {
        Ok(JobSubmission {
            job_name: generate_job_name(
                &attrs.workflow_id,
                action.order_idx,
                &action.name,
                &self.job_definition_suffix,
            ),
            job_definition: self.resolve_job_definition(&action.engine_name).await?,
            job_queue: self.job_queue.clone(),
            depends_on,
            environment: self.job_environment(action, attrs, retries_on_failures, position)?,
        })
    }

    /// Best-effort cancellation. Failures are logged, never returned.
    pub async fn cancel_previous_jobs(&self, job_ids: &[String], reason: &str) {
        for (idx, job_id) in job_ids.iter().enumerate() {
            match self.executor.cancel_job(job_id, reason).await {
                Ok(()) => info!(job_id = %job_id, "Cancelled job {}/{}", idx + 1, job_ids.len()),
                Err(e) => error!(
                    job_id = %job_id,
                    "Failed to cancel job {}/{}: {}",
                    idx + 1,
                    job_ids.len(),
                    e
                ),
            }
        }
    }

    /// Submit the whole instance as dependent jobs.
    ///
    /// Returns the actions with their `batch_job_id` recorded. On failure,
    /// everything submitted so far is cancelled and the original error is
    /// returned.
    pub async fn build(
        &self,
        actions: &[Action],
        retries_on_failures: u32,
        attrs: &WorkflowAttributes,
    ) -> Result<Vec<Action>> {
        let groups = self.group_actions(actions)?;
        if let Some(sink) = groups.last() {
            if sink.len() != 1 {
                return Err(SchedulerError::Validation(format!(
                    "the last group of a DAG must hold exactly one action, found {}",
                    sink.len()
                )));
            }
        }

        info!(
            workflow_instance_id = %attrs.workflow_instance_id,
            actions = actions.len(),
            groups = groups.len(),
            "Building DAG"
        );

        let mut submitted: Vec<String> = Vec::new();
        match self
            .submit_groups(&groups, retries_on_failures, attrs, &mut submitted)
            .await
        {
            Ok(updated) => {
                info!(workflow_instance_id = %attrs.workflow_instance_id, "Done building DAG");
                Ok(updated)
            }
            Err(e) => {
                error!(workflow_instance_id = %attrs.workflow_instance_id, "DAG build failed: {}", e);
                self.cancel_previous_jobs(&submitted, CANCEL_REASON).await;
                Err(e)
            }
        }
    }

    async fn submit_groups(
        &self,
        groups: &[Vec<Action>],
        retries_on_failures: u32,
        attrs: &WorkflowAttributes,
        submitted: &mut Vec<String>,
    ) -> Result<Vec<Action>> {
        let last_group = groups.len() - 1;
        let mut previous_group: Vec<String> = Vec::new();
        let mut updated = Vec::new();

        for (group_idx, group) in groups.iter().enumerate() {
            let mut current_group = Vec::with_capacity(group.len());
            for action in group {
                let job = self
                    .submission_for(
                        action,
                        attrs,
                        retries_on_failures,
                        JobPosition {
                            group_idx,
                            is_first: group_idx == 0,
                            is_last: group_idx == last_group,
                        },
                        previous_group.clone(),
                    )
                    .await?;
                let job_id = self.executor.submit_job(&job).await?;
                info!(job_id = %job_id, job_name = %job.job_name, depends_on = ?job.depends_on, "Submitted job");
                submitted.push(job_id.clone());
                current_group.push(job_id.clone());

                let mut with_job = action.clone();
                with_job.batch_job_id = Some(job_id);
                updated.push(self.store.update_action(&with_job).await?);
            }
            previous_group = current_group;
        }
        Ok(updated)
    }

    /// Submit one action as a standalone job and return its job id
    pub async fn submit_action(
        &self,
        action: &Action,
        attrs: &WorkflowAttributes,
    ) -> Result<String> {
        let job = self
            .submission_for(
                action,
                attrs,
                action.retries_on_failures,
                JobPosition {
                    group_idx: 0,
                    is_first: action.first_in_workflow,
                    is_last: action.last_in_workflow,
                },
                Vec::new(),
            )
            .await?;
        let job_id = self.executor.submit_job(&job).await?;
        info!(action_id = %action.id, job_id = %job_id, job_name = %job.job_name, "Submitted job");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::batch::InMemoryBatchExecutor;
    use crate::engine::engines::BatchEngine;
    use crate::engine::storage::InMemoryStateStore;
    use crate::models::{ActionState, OnFailure};
    use serde_json::json;

    const ENGINE: &str = "redshift_engine";

    fn setup() -> (Arc<InMemoryStateStore>, Arc<InMemoryBatchExecutor>, DagBuilder) {
        let store = Arc::new(InMemoryStateStore::new());
        let executor = Arc::new(InMemoryBatchExecutor::new());
        executor.register_job_definition("redshift_engine_test", 1, JobDefinitionStatus::Active);

        let mut engines = EngineRegistry::new();
        engines.register(Arc::new(BatchEngine::new(ENGINE)));

        let builder = DagBuilder::new(store.clone(), executor.clone(), engines, "queue", "test");
        (store, executor, builder)
    }

    fn attrs() -> WorkflowAttributes {
        WorkflowAttributes {
            workflow_id: "wf".into(),
            workflow_instance_id: "wfi".into(),
            datastore_id: "ds".into(),
            notification_target: Some("arn:topic".into()),
        }
    }

    fn action(name: &str, order_idx: i32, parallelization_idx: Option<i32>) -> Action {
        let action = Action::new(name, ENGINE, "ds", order_idx).with_state(ActionState::Pending);
        match parallelization_idx {
            Some(idx) => action.with_parallelization_idx(idx),
            None => action,
        }
    }

    async fn stored(store: &InMemoryStateStore, actions: Vec<Action>) -> Vec<Action> {
        let mut out = Vec::new();
        for a in actions {
            out.push(store.create_action(a).await.unwrap());
        }
        out
    }

    fn sizes(groups: &[Vec<Action>]) -> Vec<usize> {
        groups.iter().map(|g| g.len()).collect()
    }

    #[test]
    fn test_grouping_by_parallelization_idx() {
        let (_, _, builder) = setup();
        let actions: Vec<Action> = [10, 10, 20, 20, 30]
            .iter()
            .enumerate()
            .map(|(i, p)| action(&format!("a{}", i), i as i32, Some(*p)))
            .collect();

        let groups = builder.group_actions(&actions).unwrap();
        assert_eq!(sizes(&groups), vec![2, 2, 1]);
        assert_eq!(groups[0][0].name, "a0");
        assert_eq!(groups[2][0].name, "a4");
        assert_eq!(builder.grouping_fallbacks(), 0);
    }

    #[test]
    fn test_grouping_single_shared_index() {
        let (_, _, builder) = setup();
        let actions: Vec<Action> = (0..4).map(|i| action("a", i, Some(7))).collect();

        let groups = builder.group_actions(&actions).unwrap();
        assert_eq!(sizes(&groups), vec![4]);
    }

    #[test]
    fn test_grouping_falls_back_to_order_idx() {
        let (_, _, builder) = setup();
        let actions = vec![
            action("a", 0, Some(1)),
            action("b", 1, None),
            action("c", 1, Some(1)),
            action("d", 2, None),
        ];

        let groups = builder.group_actions(&actions).unwrap();
        assert_eq!(sizes(&groups), vec![1, 2, 1]);
        assert_eq!(builder.grouping_fallbacks(), 1);

        // nobody carrying an index is not a disagreement
        let plain = vec![action("a", 0, None), action("b", 1, None)];
        builder.group_actions(&plain).unwrap();
        assert_eq!(builder.grouping_fallbacks(), 1);
    }

    #[test]
    fn test_grouping_rejects_empty_input() {
        let (_, _, builder) = setup();
        assert!(matches!(
            builder.group_actions(&[]),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_multi_action_sink_is_rejected_before_submission() {
        let (_, executor, builder) = setup();
        let actions = vec![action("a", 0, Some(1)), action("b", 1, Some(2)), action("c", 2, Some(2))];

        let err = builder.build(&actions, 0, &attrs()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert_eq!(executor.submit_attempts(), 0);
    }

    #[test]
    fn test_job_name_is_sanitized_and_truncated() {
        assert_eq!(
            generate_job_name("27_characters_long_workflow", 120, "25_characters_long_action", ""),
            "27_characters_long_workflow_120_25_characters_long"
        );
        assert_eq!(
            generate_job_name("wf", 1, "load-users (daily)", "prd"),
            "wf_1_load_users_daily_prd"
        );
    }

    #[test]
    fn test_env_vars_are_strings() {
        let workflow_attrs = json!({"workflow_id": 22});
        let vars = generate_env_vars(
            workflow_attrs.as_object().unwrap(),
            &Map::new(),
            true,
            false,
        );

        assert_eq!(
            vars,
            vec![
                EnvVar::new("workflow_id", "22"),
                EnvVar::new("is_first_action", "True"),
                EnvVar::new("is_last_action", "False"),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolves_highest_active_revision() {
        let (_, executor, builder) = setup();
        executor.register_job_definition("redshift_engine_test", 3, JobDefinitionStatus::Active);
        executor.register_job_definition("redshift_engine_test", 2, JobDefinitionStatus::Active);
        executor.register_job_definition("redshift_engine_test", 9, JobDefinitionStatus::Inactive);

        let reference = builder.resolve_job_definition(ENGINE).await.unwrap();
        assert_eq!(reference, "redshift_engine_test:3");
    }

    #[tokio::test]
    async fn test_missing_job_definition_is_an_error() {
        let (store, executor, _) = setup();
        let mut engines = EngineRegistry::new();
        engines.register(Arc::new(BatchEngine::new("emr_engine")));
        let builder = DagBuilder::new(store, executor, engines, "queue", "test");

        let err = builder.resolve_job_definition("emr_engine").await.unwrap_err();
        match err {
            SchedulerError::NoJobDefinition(message) => assert!(message.contains("emr_engine_test")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_groups_depend_on_previous_group() {
        let (store, executor, builder) = setup();
        let actions = stored(
            &store,
            vec![action("a", 0, Some(1)), action("b", 1, Some(1)), action("c", 2, Some(2))],
        )
        .await;

        let updated = builder.build(&actions, 2, &attrs()).await.unwrap();
        let submissions = executor.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions[0].depends_on.is_empty());
        assert!(submissions[1].depends_on.is_empty());

        let first_group: Vec<String> = updated[..2]
            .iter()
            .map(|a| a.batch_job_id.clone().unwrap())
            .collect();
        assert_eq!(submissions[2].depends_on, first_group);

        // job ids are written back to the store
        for action in &updated {
            let persisted = store.get_action(&action.id).await.unwrap().unwrap();
            assert_eq!(persisted.batch_job_id, action.batch_job_id);
        }
    }

    #[tokio::test]
    async fn test_environment_carries_position_and_policy() {
        let (store, executor, builder) = setup();
        let actions = stored(
            &store,
            vec![
                action("a", 0, None).with_on_failure(OnFailure::Continue),
                action("b", 1, None),
            ],
        )
        .await;

        builder.build(&actions, 1, &attrs()).await.unwrap();
        let submissions = executor.submissions();

        let env_of = |idx: usize| -> Map<String, Value> {
            let input = submissions[idx]
                .environment
                .iter()
                .find(|v| v.name == INPUT_ENV)
                .unwrap();
            let vars: Vec<EnvVar> = serde_json::from_str(&input.value).unwrap();
            vars.into_iter().map(|v| (v.name, Value::String(v.value))).collect()
        };

        let first = env_of(0);
        assert_eq!(first["is_first_action"], "True");
        assert_eq!(first["is_last_action"], "False");
        assert_eq!(first["is_continue_on_failure"], "True");
        assert_eq!(first["retries_on_failures"], "1");
        assert_eq!(first["sns_arn"], "arn:topic");

        let last = env_of(1);
        assert_eq!(last["is_first_action"], "False");
        assert_eq!(last["is_last_action"], "True");
        assert_eq!(last["is_continue_on_failure"], "False");
        assert_eq!(last["ACTION_ID"], Value::String(actions[1].id.clone()));
        assert_eq!(last["input_key"], "wfi_0.dat");
    }

    #[tokio::test]
    async fn test_failed_submission_cancels_earlier_jobs() {
        let (store, executor, builder) = setup();
        let actions = stored(
            &store,
            (0..5).map(|i| action(&format!("step{}", i), i, Some(i))).collect(),
        )
        .await;
        executor.fail_submission_at(3);

        let err = builder.build(&actions, 0, &attrs()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobSubmission { .. }));

        let submitted: Vec<String> = store
            .find_actions(&Default::default())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|a| a.batch_job_id)
            .collect();
        assert_eq!(submitted.len(), 2);

        let mut cancelled = executor.cancelled_jobs();
        cancelled.sort();
        let mut expected = submitted;
        expected.sort();
        assert_eq!(cancelled, expected);
        assert_eq!(executor.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn test_submit_action_has_no_dependencies() {
        let (_, executor, builder) = setup();
        let mut single = action("solo", 3, None);
        single.first_in_workflow = true;

        let job_id = builder
            .submit_action(&single, &WorkflowAttributes::from_action(&single, None))
            .await
            .unwrap();
        assert!(!job_id.is_empty());
        let submissions = executor.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].depends_on.is_empty());
        assert_eq!(submissions[0].job_queue, "queue");
    }
}
