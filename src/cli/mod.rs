//! Command-line interface for ledger-deploy.
//!
//! Provides commands for running plans, inspecting checkpoints and run
//! history, reconciling checkpoints by hand, and validating plans.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::adapters::{ChainClient, CommandClient, Operation, SimulatedLedger};
use crate::config;
use crate::core::{roles, CheckpointStore, Journal, Plan, PlanRunner, RetryPolicy, StepAction};
use crate::domain::{Checkpoint, Environment, RunState, StepResult};
use crate::error::DeployError;

/// ledger-deploy - Resumable, idempotent contract deployment orchestrator
#[derive(Parser, Debug)]
#[command(name = "ledger-deploy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run (or resume) a plan against a network
    Run {
        /// Plan file, or name looked up as plans/<name>.yaml
        plan: String,

        /// Target network
        #[arg(short, long, env = "NETWORK")]
        network: Environment,

        /// Execute against an in-memory ledger without touching the
        /// working checkpoint
        #[arg(long)]
        dry_run: bool,

        /// Seed the working checkpoint from an archived record
        #[arg(long)]
        from: Option<PathBuf>,

        /// Extra plan input (repeatable)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Helper program that submits operations to the ledger
        #[arg(long, env = "LEDGER_DEPLOY_CLIENT")]
        client: Option<String>,
    },

    /// Show the working checkpoint and the latest run
    Status {
        #[arg(short, long, env = "NETWORK")]
        network: Environment,
    },

    /// List past runs from the journal
    History {
        #[arg(short, long, env = "NETWORK")]
        network: Environment,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Record a value or completed action by hand (reconciliation after an
    /// interrupted step)
    Record {
        #[arg(short, long, env = "NETWORK")]
        network: Environment,

        /// Result key, or action description with --action
        key: String,

        /// Value to record (required unless --action)
        value: Option<String>,

        /// Mark an idempotent action as done instead of recording a value
        #[arg(long)]
        action: bool,

        /// Overwrite an existing value
        #[arg(long)]
        force: bool,
    },

    /// Validate a plan without running it
    Validate {
        /// Plan file, or name looked up as plans/<name>.yaml
        plan: String,
    },

    /// List archived deployment records
    Records {
        #[arg(short, long, env = "NETWORK")]
        network: Environment,
    },

    /// Print an archived deployment record
    Show {
        /// Path to the record
        record: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                plan,
                network,
                dry_run,
                from,
                inputs,
                client,
            } => {
                let plan = load_plan(&plan, &inputs)?;
                if dry_run {
                    dry_run_plan(&plan, &network, from.as_deref()).await
                } else {
                    run_plan(&plan, &network, from.as_deref(), client).await
                }
            }
            Commands::Status { network } => show_status(&network).await,
            Commands::History { network, limit } => show_history(&network, limit).await,
            Commands::Record {
                network,
                key,
                value,
                action,
                force,
            } => record_entry(&network, &key, value, action, force).await,
            Commands::Validate { plan } => validate_plan(&plan),
            Commands::Records { network } => list_records(&network).await,
            Commands::Show { record } => show_record(&record).await,
            Commands::Config => show_config(),
        }
    }
}

/// Load a plan and merge inputs given on the command line
fn load_plan(name: &str, inputs: &[String]) -> Result<Plan> {
    let path = config::plan_path(name)?;
    let mut plan = Plan::from_file(&path)?;

    for (key, value) in parse_inputs(inputs)? {
        plan.inputs.insert(key, value);
    }

    plan.validate()
        .with_context(|| format!("Invalid plan: {}", path.display()))?;
    Ok(plan)
}

fn parse_inputs(inputs: &[String]) -> Result<Vec<(String, String)>> {
    inputs
        .iter()
        .map(|raw| {
            let (key, value) = raw
                .split_once('=')
                .with_context(|| format!("Invalid input '{}', expected KEY=VALUE", raw))?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("Invalid input '{}', key is empty", raw);
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn store() -> Result<CheckpointStore> {
    Ok(CheckpointStore::new(config::deployments_dir()?))
}

/// Copy an archived record into an empty working checkpoint
async fn seed_from_record(store: &CheckpointStore, env: &Environment, record: &Path) -> Result<()> {
    let current = store.load(env).await?;
    if !current.is_empty() {
        anyhow::bail!(
            "{} already has a working checkpoint ({}); finish or remove it before seeding from a record",
            env,
            store.partial_path(env).display()
        );
    }

    let seeded = CheckpointStore::load_record(record).await?;
    store.save(env, &seeded).await?;
    info!(record = %record.display(), entries = seeded.len(), "Seeded checkpoint from record");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
///
/// The SIGTERM handler is installed when this is called, so a signal that
/// arrives before the future is first polled is not lost. A handler that
/// cannot be installed never fires.
fn shutdown_signal() -> impl Future<Output = ()> {
    let terminate = terminate_listener();

    async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = interrupt => warn!("Interrupt received, flushing checkpoint"),
            _ = terminate => warn!("Terminate received, flushing checkpoint"),
        }
    }
}

#[cfg(unix)]
fn terminate_listener() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let stream = signal(SignalKind::terminate())
        .map_err(|e| warn!(error = %e, "Failed to listen for SIGTERM"))
        .ok();

    async move {
        match stream {
            Some(mut stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(unix))]
fn terminate_listener() -> impl Future<Output = ()> {
    std::future::pending::<()>()
}

const TINYBAR_PER_HBAR: u64 = 100_000_000;

/// Render tinybar as hbar without rounding
fn format_hbar(tinybar: u64) -> String {
    let whole = tinybar / TINYBAR_PER_HBAR;
    let fraction = format!("{:08}", tinybar % TINYBAR_PER_HBAR);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{} hbar", whole)
    } else {
        format!("{}.{} hbar", whole, fraction)
    }
}

/// Operator balance, or `None` if the client cannot report it
async fn operator_balance<C: ChainClient>(client: &C) -> Option<u64> {
    match client.balance().await {
        Ok(balance) => balance,
        Err(e) => {
            warn!(error = %e, "Failed to query operator balance");
            None
        }
    }
}

/// Run a plan against the configured chain client
async fn run_plan(
    plan: &Plan,
    env: &Environment,
    from: Option<&Path>,
    client: Option<String>,
) -> Result<()> {
    let cfg = config::config()?;
    let store = store()?;

    let program = client.or_else(|| cfg.client.command.clone()).context(
        "No chain client configured. Set client.command in .ledger-deploy/config.yaml, \
         LEDGER_DEPLOY_CLIENT, or use --dry-run",
    )?;

    if let Some(record) = from {
        seed_from_record(&store, env, record).await?;
    }

    let client = CommandClient::new(program, cfg.client.args.clone(), cfg.client.timeout());
    let runner = PlanRunner::new(store, client, cfg.retry.clone());
    info!(
        client = runner.client().program(),
        network = %env,
        max_attempts = cfg.retry.max_attempts,
        "Using chain client"
    );

    let balance_before = operator_balance(runner.client()).await;
    let outcome = runner.run_until(plan, env, shutdown_signal()).await;

    if let Some(before) = balance_before {
        if let Some(after) = operator_balance(runner.client()).await {
            let cost = before.saturating_sub(after);
            info!(before, after, cost, "Operator balance");
            eprintln!("\nHBAR cost: {} ({} tinybar)", format_hbar(cost), cost);
        }
    }

    match outcome {
        Ok(run) => {
            eprintln!(
                "\n[Run {} completed: {} remote calls, record {}]",
                run.id,
                run.remote_calls,
                run.record_path.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Err(e) => exit_aborted(runner.store(), env, e),
    }
}

fn exit_aborted(store: &CheckpointStore, env: &Environment, error: DeployError) -> ! {
    eprintln!("\n[Run aborted: {}]", error);
    if error.is_ordering() {
        eprintln!("The plan references a key that is not recorded; fix the plan or use `record`.");
    }
    eprintln!(
        "Progress is saved in {}. Rerun the same command to resume.",
        store.partial_path(env).display()
    );
    std::process::exit(error.exit_code());
}

/// What a dry run submitted and how it ended
struct DryRun {
    calls: Vec<Operation>,
    /// Final record on success
    outcome: Result<Option<Checkpoint>, DeployError>,
}

/// Run `plan` on an in-memory ledger with a scratch copy of `current`.
///
/// The scratch directory is created under `scratch_root` and removed before
/// returning, whatever the outcome.
async fn simulate(
    plan: &Plan,
    env: &Environment,
    current: &Checkpoint,
    scratch_root: &Path,
) -> Result<DryRun> {
    let scratch = tempfile::TempDir::new_in(scratch_root)
        .context("Failed to create scratch directory")?;
    let scratch_store = CheckpointStore::new(scratch.path());
    if !current.is_empty() {
        scratch_store.save(env, current).await?;
    }

    let runner = PlanRunner::new(scratch_store, SimulatedLedger::new(), RetryPolicy::immediate(1));
    let outcome = match runner.run(plan, env).await {
        Ok(run) => match run.record_path {
            Some(record) => Ok(Some(CheckpointStore::load_record(Path::new(&record)).await?)),
            None => Ok(None),
        },
        Err(e) => Err(e),
    };
    let calls = runner.client().calls();

    drop(runner);
    scratch.close().context("Failed to remove scratch directory")?;

    Ok(DryRun { calls, outcome })
}

/// Execute a plan against an in-memory ledger in a scratch directory
async fn dry_run_plan(plan: &Plan, env: &Environment, from: Option<&Path>) -> Result<()> {
    let current = match from {
        Some(record) => CheckpointStore::load_record(record).await?,
        None => store()?.load(env).await?,
    };

    let dry_run = simulate(plan, env, &current, &std::env::temp_dir()).await?;

    println!(
        "Dry run of '{}' on {} ({} entries already recorded)",
        plan.name,
        env,
        current.len()
    );
    println!();

    if dry_run.calls.is_empty() {
        println!("Nothing to do: every step is already recorded.");
    } else {
        println!("Operations that would be submitted:");
        for (i, op) in dry_run.calls.iter().enumerate() {
            println!("  {:>3}. {}", i + 1, describe(op));
        }
    }

    match dry_run.outcome {
        Ok(record) => {
            if let Some(checkpoint) = record {
                println!();
                println!("Resulting record (simulated addresses):");
                println!("{}", checkpoint.to_json_pretty()?);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[Dry run aborted: {}]", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn describe(op: &Operation) -> String {
    match op {
        Operation::CreateContract(c) => format!(
            "create {} (gas {}, {} args)",
            c.artifact,
            c.gas,
            c.constructor_args.len()
        ),
        Operation::CreateAccount(a) => format!("create account (balance {})", a.initial_balance),
        Operation::Call(c) => format!("call {}.{} (gas {})", c.contract, c.function, c.gas),
        Operation::Query(q) => format!("query {}.{}", q.contract, q.function),
        Operation::Balance => "query operator balance".to_string(),
    }
}

/// Show the working checkpoint and the latest run
async fn show_status(env: &Environment) -> Result<()> {
    let store = store()?;
    let checkpoint = store.load(env).await?;

    println!("Network: {}", env);
    println!("Checkpoint: {}", store.partial_path(env).display());

    if checkpoint.is_empty() {
        println!("\nNo deployment in progress");
    } else {
        print_checkpoint(&checkpoint);
    }

    let journal = Journal::open(store.dir(), env);
    if let Some(run) = journal.latest_run(env).await? {
        println!("\nLatest run: {}", run.id);
        println!("  Plan:    {}", run.plan_name);
        println!("  State:   {}", state_label(&run.state));
        println!("  Started: {}", run.started_at);
        if let Some(finished) = run.finished_at {
            println!("  Ended:   {}", finished);
        }
        if let RunState::Aborted { error } = &run.state {
            println!("  Error:   {}", error);
        }
        println!("  Remote calls: {}", run.remote_calls);
        println!("\nStep statuses:");
        for (step, status) in &run.step_statuses {
            println!("  {}: {:?}", step, status);
        }
    }

    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!("\nResults:");
    for (key, value) in checkpoint.results() {
        println!("  {:<40} {}", key, value.render());
    }

    let actions: Vec<_> = checkpoint.actions().collect();
    if !actions.is_empty() {
        println!("\nActions:");
        for (description, done) in actions {
            println!("  [{}] {}", if done { "x" } else { " " }, description);
        }
    }
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Aborted { .. } => "aborted",
    }
}

/// List runs recorded in the journal, newest first
async fn show_history(env: &Environment, limit: usize) -> Result<()> {
    let journal = Journal::open(&config::deployments_dir()?, env);
    let runs = journal.runs(env).await?;

    if runs.is_empty() {
        println!("No runs found for {}", env);
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<6} {}",
        "RUN ID", "PLAN", "STATE", "CALLS", "STARTED"
    );
    println!("{}", "-".repeat(100));

    for run in runs.iter().rev().take(limit) {
        println!(
            "{:<38} {:<20} {:<10} {:<6} {}",
            run.id,
            run.plan_name,
            state_label(&run.state),
            run.remote_calls,
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Record a result or action by hand
async fn record_entry(
    env: &Environment,
    key: &str,
    value: Option<String>,
    action: bool,
    force: bool,
) -> Result<()> {
    let store = store()?;
    let mut checkpoint = store.load(env).await?;

    if action {
        if value.is_some() {
            anyhow::bail!("--action takes no value");
        }
        checkpoint.mark_action_done(key);
        println!("Marked done: {}", key);
    } else {
        let value = value.context("A value is required unless --action is given")?;
        if let Some(existing) = checkpoint.get(key) {
            if !force {
                anyhow::bail!(
                    "'{}' is already recorded as {}; use --force to overwrite",
                    key,
                    existing.render()
                );
            }
        }
        checkpoint.insert(key, StepResult::from(value.clone()));
        println!("Recorded {} = {}", key, value);
    }

    store.save(env, &checkpoint).await?;
    info!(network = %env, key, "Checkpoint updated by hand");
    Ok(())
}

/// Validate a plan and print its steps
fn validate_plan(name: &str) -> Result<()> {
    let plan = load_plan(name, &[])?;

    println!("Plan '{}' is valid ({} steps)", plan.name, plan.steps.len());
    if !plan.description.is_empty() {
        println!("{}", plan.description);
    }
    println!("Fingerprint: {}", plan.fingerprint());

    if !plan.inputs.is_empty() {
        println!("\nInputs:");
        for (key, value) in &plan.inputs {
            println!("  {} = {}", key, value);
        }
    }

    println!("\nSteps:");
    for (i, step) in plan.steps.iter().enumerate() {
        let kind = if step.is_action() { "action" } else { "result" };
        println!("  {:>3}. [{}] {}", i + 1, kind, step.label());
    }

    let mut unknown_roles: Vec<&str> = plan
        .steps
        .iter()
        .filter_map(|step| match &step.action {
            StepAction::GrantRole(spec) | StepAction::RenounceRole(spec) => Some(spec.role.as_str()),
            _ => None,
        })
        .filter(|role| !role.contains("${") && !role.starts_with("0x") && !roles::is_known(role))
        .collect();
    unknown_roles.sort_unstable();
    unknown_roles.dedup();
    for role in unknown_roles {
        println!("\nwarning: '{}' is not a known role name; check for typos", role);
    }

    let external = plan.external_dependencies();
    if !external.is_empty() {
        println!("\nMust be recorded before running:");
        for key in external {
            println!("  {}", key);
        }
    }

    Ok(())
}

/// List archived records for a network
async fn list_records(env: &Environment) -> Result<()> {
    let records = store()?.list_records(env).await?;

    if records.is_empty() {
        println!("No archived records for {}", env);
        return Ok(());
    }

    for path in records {
        let checkpoint = CheckpointStore::load_record(&path).await?;
        println!("{}  ({} entries)", path.display(), checkpoint.len());
    }

    Ok(())
}

async fn show_record(path: &Path) -> Result<()> {
    let checkpoint = CheckpointStore::load_record(path).await?;
    println!("{}", checkpoint.to_json_pretty()?);
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("ledger-deploy configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Deployments: {}", cfg.deployments.display());
    println!("  Plans:       {}", cfg.plans.display());
    println!();
    println!("Retry policy:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);
    println!();
    println!("Chain client:");
    println!(
        "  Command: {}",
        cfg.client.command.as_deref().unwrap_or("(not set)")
    );
    if !cfg.client.args.is_empty() {
        println!("  Args:    {}", cfg.client.args.join(" "));
    }
    println!("  Timeout: {}s", cfg.client.timeout_seconds);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs() {
        let parsed = parse_inputs(&[
            "Multisig=0x00aa".to_string(),
            "Vesting Bot = 0x00bb".to_string(),
        ])
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Multisig".to_string(), "0x00aa".to_string()),
                ("Vesting Bot".to_string(), "0x00bb".to_string()),
            ]
        );

        assert!(parse_inputs(&["novalue".to_string()]).is_err());
        assert!(parse_inputs(&["=0x1".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "ledger-deploy",
            "run",
            "pangolin-hedera",
            "--network",
            "testnet",
            "--dry-run",
            "-i",
            "Multisig=0x1",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                plan,
                network,
                dry_run,
                inputs,
                ..
            } => {
                assert_eq!(plan, "pangolin-hedera");
                assert_eq!(network.as_str(), "testnet");
                assert!(dry_run);
                assert_eq!(inputs, vec!["Multisig=0x1"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_bad_network() {
        let result = Cli::try_parse_from([
            "ledger-deploy",
            "status",
            "--network",
            "../etc",
        ]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_seed_from_record_refuses_existing_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let env = Environment::new("testnet").unwrap();

        let mut record = Checkpoint::new();
        record.insert("Token", "0x111");
        let record_path = dir.path().join("testnet@1.json");
        std::fs::write(&record_path, record.to_json_pretty().unwrap()).unwrap();

        seed_from_record(&store, &env, &record_path).await.unwrap();
        assert_eq!(store.load(&env).await.unwrap(), record);

        assert!(seed_from_record(&store, &env, &record_path).await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_removes_scratch_directory() {
        let root = tempfile::TempDir::new().unwrap();
        let env = Environment::new("testnet").unwrap();
        let entries = || std::fs::read_dir(root.path()).unwrap().count();

        let ok = Plan::new("multicall")
            .step(crate::core::Step::create_contract("Multicall2", "Multicall2", 100_000));
        let dry_run = simulate(&ok, &env, &Checkpoint::new(), root.path()).await.unwrap();
        let record = dry_run.outcome.unwrap().unwrap();
        assert!(record.contains_result("Multicall2"));
        assert_eq!(entries(), 0);

        let failing = Plan::new("forwarder").step(crate::core::Step::approve("${Forwarder}"));
        let dry_run = simulate(&failing, &env, &Checkpoint::new(), root.path())
            .await
            .unwrap();
        assert!(matches!(
            dry_run.outcome,
            Err(DeployError::MissingDependency { .. })
        ));
        assert!(dry_run.calls.is_empty());
        assert_eq!(entries(), 0);
    }

    #[test]
    fn test_format_hbar() {
        assert_eq!(format_hbar(0), "0 hbar");
        assert_eq!(format_hbar(1_900_000_000), "19 hbar");
        assert_eq!(format_hbar(1_905_000_000), "19.05 hbar");
        assert_eq!(format_hbar(1), "0.00000001 hbar");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let shutdown = shutdown_signal();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), shutdown)
            .await
            .unwrap();
    }
}
