//! Plan runner: drives a plan's steps against a chain client.
//!
//! For every step, in order: skip it if its record key is already in the
//! checkpoint, otherwise submit its operation through the retry policy,
//! record the result and save the checkpoint before moving on. Any failure
//! flushes the checkpoint and aborts the run; completing the last step
//! archives it.
//!
//! No two steps of a run may resolve to the same record key, or the second
//! would be skipped as if it had already run.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::ChainClient;
use crate::domain::{Checkpoint, Environment, Event, EventType, RecordKey, Run, RunState};
use crate::error::{CheckpointError, DeployError};

use super::checkpoint_store::CheckpointStore;
use super::journal::Journal;
use super::plan::{Plan, Step};
use super::retry::{Attempted, RetryError, RetryPolicy};

/// Executes plans for one chain client
pub struct PlanRunner<C> {
    store: CheckpointStore,
    client: C,
    retry: RetryPolicy,
}

/// Mutable state threaded through a single run
struct RunContext<'a> {
    env: &'a Environment,
    journal: Journal,
    run: Run,
    checkpoint: Checkpoint,
    /// Record keys resolved so far, skipped steps included
    seen: HashSet<RecordKey>,
}

impl RunContext<'_> {
    fn event(&self, step: Option<&RecordKey>, event_type: EventType, message: String) -> Event {
        Event::new(
            self.run.id,
            step.map(|s| s.name().to_string()),
            event_type,
            message,
        )
    }

    /// Apply to the in-memory run and append to the journal
    async fn emit(&mut self, event: Event) -> Result<(), DeployError> {
        self.run.apply_event(&event);
        self.journal
            .append(&event)
            .await
            .map_err(|e| CheckpointError::Journal(format!("{:#}", e)).into())
    }

    async fn step_failed(&mut self, record: &RecordKey, attempts: Option<u32>, error: &DeployError) {
        let mut event = self
            .event(Some(record), EventType::StepFailed, format!("{} failed", record))
            .with_error(error.to_string());
        if let Some(attempts) = attempts {
            event = event.with_attempt(attempts);
        }
        if let Err(e) = self.emit(event).await {
            warn!(error = %e, "Failed to journal step failure");
        }
    }
}

impl<C: ChainClient> PlanRunner<C> {
    pub fn new(store: CheckpointStore, client: C, retry: RetryPolicy) -> Self {
        Self {
            store,
            client,
            retry,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run a plan to completion or the first failure
    pub async fn run(&self, plan: &Plan, env: &Environment) -> Result<Run, DeployError> {
        self.run_until(plan, env, std::future::pending()).await
    }

    /// Run a plan, aborting with [`DeployError::Cancelled`] if `shutdown`
    /// resolves while a step is in flight.
    ///
    /// The checkpoint is flushed before any error is returned, so rerunning
    /// the same plan against the same environment resumes where this run
    /// stopped.
    #[instrument(skip(self, plan, shutdown), fields(plan = %plan.name, env = %env))]
    pub async fn run_until<S>(
        &self,
        plan: &Plan,
        env: &Environment,
        shutdown: S,
    ) -> Result<Run, DeployError>
    where
        S: Future<Output = ()>,
    {
        plan.validate()?;

        let journal = Journal::open(self.store.dir(), env);
        let previous = journal
            .latest_run(env)
            .await
            .map_err(|e| DeployError::from(CheckpointError::Journal(format!("{:#}", e))))?;
        let checkpoint = self.store.load(env).await?;
        let fingerprint = plan.fingerprint();

        if !checkpoint.is_empty() {
            info!(recorded = checkpoint.len(), "Resuming from checkpoint");
            let prior = previous.and_then(|run| run.plan_fingerprint);
            if let Some(prior) = prior.filter(|prior| *prior != fingerprint) {
                warn!(
                    previous = %prior,
                    current = %fingerprint,
                    "Checkpoint was produced by a different version of this plan"
                );
            }
        }

        let mut ctx = RunContext {
            env,
            journal,
            run: Run::new(Uuid::new_v4(), env.clone(), plan.name.clone()),
            checkpoint,
            seen: HashSet::new(),
        };

        info!(run_id = %ctx.run.id, steps = plan.steps.len(), client = self.client.name(), "Starting run");

        let start = ctx
            .event(
                None,
                EventType::RunStarted,
                format!("Plan '{}' started on {}", plan.name, env),
            )
            .with_detail(plan.name.clone())
            .with_fingerprint(fingerprint);
        if let Err(e) = ctx.emit(start).await {
            return Err(self.abort(&mut ctx, e).await);
        }

        if let Err(e) = self.seed_inputs(plan, &mut ctx).await {
            return Err(self.abort(&mut ctx, e).await);
        }

        let mut shutdown = std::pin::pin!(shutdown);

        for step in &plan.steps {
            if let Err(e) = self.advance(step, &mut ctx, shutdown.as_mut()).await {
                return Err(self.abort(&mut ctx, e).await);
            }
        }

        self.complete(&mut ctx).await
    }

    /// Record plan inputs that are not yet in the checkpoint
    async fn seed_inputs(&self, plan: &Plan, ctx: &mut RunContext<'_>) -> Result<(), DeployError> {
        let mut seeded = false;

        for (key, value) in &plan.inputs {
            if ctx.checkpoint.contains_result(key) {
                continue;
            }
            ctx.checkpoint.insert(key.clone(), value.clone());
            seeded = true;

            debug!(key = %key, value = %value, "Recorded input");
            let record = RecordKey::Result(key.clone());
            let event = ctx.event(
                Some(&record),
                EventType::InputRecorded,
                format!("Input {} = {}", key, value),
            );
            ctx.emit(event).await?;
        }

        if seeded {
            self.store.save(ctx.env, &ctx.checkpoint).await?;
        }
        Ok(())
    }

    /// Move one step from pending to skipped or committed
    async fn advance<S>(
        &self,
        step: &Step,
        ctx: &mut RunContext<'_>,
        shutdown: Pin<&mut S>,
    ) -> Result<(), DeployError>
    where
        S: Future<Output = ()>,
    {
        let record = match step.record_key(&ctx.checkpoint) {
            Ok(record) => record,
            Err(e) => {
                let record = RecordKey::Action(step.label());
                ctx.step_failed(&record, None, &e).await;
                return Err(e);
            }
        };

        if !ctx.seen.insert(record.clone()) {
            let e = DeployError::InvalidPlan(format!(
                "step '{}' records under '{}', which an earlier step already uses",
                step.label(),
                record
            ));
            ctx.step_failed(&record, None, &e).await;
            return Err(e);
        }

        if ctx.checkpoint.contains(&record) {
            info!(step = %record, "Already recorded, skipping");
            let event = ctx.event(
                Some(&record),
                EventType::StepSkipped,
                format!("{} already recorded", record),
            );
            return ctx.emit(event).await;
        }

        let op = match step.operation(&ctx.checkpoint) {
            Ok(op) => op,
            Err(e) => {
                ctx.step_failed(&record, None, &e).await;
                return Err(e);
            }
        };

        info!(step = %record, operation = op.label(), "Executing");
        let event = ctx.event(
            Some(&record),
            EventType::StepStarted,
            format!("Executing {}", record),
        );
        ctx.emit(event).await?;

        let started = Instant::now();
        let client = &self.client;
        let op_ref = &op;
        let submitted = tokio::select! {
            biased;
            _ = shutdown => None,
            result = self.retry.execute(move || client.submit(op_ref)) => Some(result),
        };

        let Some(result) = submitted else {
            let e = DeployError::Cancelled {
                step: record.to_string(),
            };
            warn!(step = %record, "Cancelled while in flight; the operation may have landed");
            ctx.step_failed(&record, None, &e).await;
            return Err(e);
        };

        let Attempted { value, attempts } = match result {
            Ok(attempted) => attempted,
            Err(RetryError::Fatal { attempt, error }) => {
                let e = DeployError::Rejected {
                    step: record.to_string(),
                    source: error,
                };
                ctx.step_failed(&record, Some(attempt), &e).await;
                return Err(e);
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let e = DeployError::RetryExhausted {
                    step: record.to_string(),
                    attempts,
                    source: last,
                };
                ctx.step_failed(&record, Some(attempts), &e).await;
                return Err(e);
            }
        };

        let result = match step.decode(value) {
            Ok(result) => result,
            Err(e) => {
                ctx.step_failed(&record, Some(attempts), &e).await;
                return Err(e);
            }
        };

        let rendered = result.render();
        ctx.checkpoint.record(&record, result);
        self.store.save(ctx.env, &ctx.checkpoint).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(step = %record, value = %rendered, attempts, duration_ms, "Committed");

        let event = ctx
            .event(
                Some(&record),
                EventType::StepCommitted,
                format!("{} = {}", record, rendered),
            )
            .with_attempt(attempts)
            .with_duration(duration_ms);
        ctx.emit(event).await
    }

    async fn complete(&self, ctx: &mut RunContext<'_>) -> Result<Run, DeployError> {
        let record = match self.store.archive(ctx.env, &ctx.checkpoint).await {
            Ok(record) => record,
            Err(e) => return Err(self.abort(ctx, e.into()).await),
        };

        let event = ctx
            .event(
                None,
                EventType::RunCompleted,
                format!("Archived to {}", record.display()),
            )
            .with_detail(record.display().to_string());
        if let Err(e) = ctx.emit(event).await {
            // The record is already archived; the run itself succeeded
            warn!(error = %e, "Failed to journal run completion");
            ctx.run.state = RunState::Completed;
            ctx.run.record_path = Some(record.display().to_string());
        }

        info!(
            run_id = %ctx.run.id,
            remote_calls = ctx.run.remote_calls,
            record = %record.display(),
            "Run completed"
        );

        Ok(ctx.run.clone())
    }

    /// Best-effort flush, then mark the run aborted
    async fn abort(&self, ctx: &mut RunContext<'_>, error: DeployError) -> DeployError {
        match self.store.save(ctx.env, &ctx.checkpoint).await {
            Ok(()) => {
                let event = ctx.event(
                    None,
                    EventType::CheckpointFlushed,
                    format!("Checkpoint flushed with {} entries", ctx.checkpoint.len()),
                );
                if let Err(e) = ctx.emit(event).await {
                    warn!(error = %e, "Failed to journal checkpoint flush");
                }
            }
            Err(e) => error!(error = %e, "Failed to flush checkpoint"),
        }

        let event = ctx
            .event(None, EventType::RunAborted, "Run aborted".to_string())
            .with_error(error.to_string());
        if let Err(e) = ctx.emit(event).await {
            warn!(error = %e, "Failed to journal run abort");
        }

        error!(run_id = %ctx.run.id, error = %error, "Run aborted");
        error
    }
}
