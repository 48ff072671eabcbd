//! Plan File Integration Tests
//!
//! Loads the plans shipped in plans/ and runs them against the simulated
//! ledger.

use std::path::{Path, PathBuf};

use ledger_deploy::adapters::{AbiValue, Operation, SimulatedLedger};
use ledger_deploy::core::{role_hash, CheckpointStore, Plan, PlanRunner, RetryPolicy};
use ledger_deploy::domain::Environment;
use tempfile::TempDir;

const DEPLOYER: &str = "0x00000000000000000000000000000000000004d2";
const ETA: &str = "1767225600";

fn plan_file(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("plans")
        .join(format!("{}.yaml", name))
}

fn pangolin() -> Plan {
    let mut plan = Plan::from_file(&plan_file("pangolin-hedera")).unwrap();
    plan.inputs.insert("Deployer".to_string(), DEPLOYER.to_string());
    plan.inputs.insert("Eta".to_string(), ETA.to_string());
    plan
}

fn env() -> Environment {
    Environment::new("testnet").unwrap()
}

#[test]
fn test_pangolin_plan_is_valid() {
    let plan = Plan::from_file(&plan_file("pangolin-hedera")).unwrap();

    plan.validate().unwrap();
    assert_eq!(plan.external_dependencies(), vec!["Deployer", "Eta"]);
    assert!(plan.get_step("Pair PNG/WHBAR (Contract)").is_some());
    assert!(plan.get_step("SSS NFT (HTS)").is_some());
}

#[test]
fn test_start_vesting_plan_is_valid() {
    let plan = Plan::from_file(&plan_file("start-vesting")).unwrap();
    plan.validate().unwrap();
    assert_eq!(plan.external_dependencies(), vec!["TreasuryVester"]);
}

#[tokio::test]
async fn test_pangolin_plan_runs_end_to_end() {
    let dir = TempDir::new().unwrap();
    let plan = pangolin();
    let runner = PlanRunner::new(
        CheckpointStore::new(dir.path()),
        SimulatedLedger::new(),
        RetryPolicy::immediate(2),
    );

    let run = runner.run(&plan, &env()).await.unwrap();

    // One remote call per step; inputs cost nothing
    assert_eq!(runner.client().call_count(), plan.steps.len());
    assert_eq!(run.remote_calls as usize, plan.steps.len());

    let record = CheckpointStore::load_record(Path::new(run.record_path.as_deref().unwrap()))
        .await
        .unwrap();
    assert_eq!(
        record.get("Deployer").and_then(|v| v.as_str()),
        Some(DEPLOYER)
    );
    assert!(record.contains_result("Pair PNG/WHBAR (Contract)"));
    assert!(record.contains_result("Multicall2"));

    let vester = record.get("TreasuryVester").unwrap().render();
    assert!(record.is_action_done(&format!(
        "Renounce DEFAULT_ADMIN_ROLE from {} on {}",
        DEPLOYER, vester
    )));

    // Timelock admin hand-over is queued for the Governor
    let timelock = record.get("Timelock").unwrap().render();
    let governor = record.get("Governor").unwrap().render();
    assert!(record.is_action_done(&format!(
        "Queue Governor as pending admin of {}",
        timelock
    )));

    let queued = runner
        .client()
        .calls()
        .into_iter()
        .find_map(|op| match op {
            Operation::Call(call) if call.function == "queueTransaction" => Some(call),
            _ => None,
        })
        .unwrap();
    assert_eq!(queued.contract, timelock);
    assert_eq!(queued.gas, 1_000_000);
    assert_eq!(
        queued.args,
        vec![
            AbiValue::Address(timelock.clone()),
            AbiValue::Uint256("0".into()),
            AbiValue::String("setPendingAdmin(address)".into()),
            AbiValue::Bytes(format!("0x{}{}", "0".repeat(24), &governor[2..])),
            AbiValue::Uint256(ETA.into()),
        ]
    );
}

#[tokio::test]
async fn test_pangolin_plan_waits_for_eta() {
    let dir = TempDir::new().unwrap();
    let mut plan = pangolin();
    plan.inputs.remove("Eta");

    let runner = PlanRunner::new(
        CheckpointStore::new(dir.path()),
        SimulatedLedger::new(),
        RetryPolicy::immediate(2),
    );
    let err = runner.run(&plan, &env()).await.unwrap_err();

    assert!(err.is_ordering());
    assert!(err.to_string().contains("Eta"));
    assert_eq!(runner.client().calls_to("queueTransaction"), 0);
}

#[tokio::test]
async fn test_pangolin_calls_are_fully_resolved() {
    let dir = TempDir::new().unwrap();
    let runner = PlanRunner::new(
        CheckpointStore::new(dir.path()),
        SimulatedLedger::new(),
        RetryPolicy::immediate(2),
    );
    runner.run(&pangolin(), &env()).await.unwrap();

    let calls = runner.client().calls();

    let set_recipients = calls
        .iter()
        .find_map(|op| match op {
            Operation::Call(call) if call.function == "setRecipients" => Some(call),
            _ => None,
        })
        .unwrap();
    match &set_recipients.args[..] {
        [AbiValue::AddressArray(accounts), AbiValue::Int64Array(allocations)] => {
            assert_eq!(accounts.len(), 3);
            assert!(accounts.iter().all(|a| a.starts_with("0x") && a.len() == 42));
            assert_eq!(allocations.iter().sum::<i64>(), 10_000);
        }
        other => panic!("unexpected setRecipients args {:?}", other),
    }

    let initialize = calls
        .iter()
        .find_map(|op| match op {
            Operation::Call(call) if call.function == "initializePool" => Some(call),
            _ => None,
        })
        .unwrap();
    assert_eq!(initialize.args[2], AbiValue::Uint8(2));

    let funder = role_hash("FUNDER_ROLE");
    let funder_grants = calls
        .iter()
        .filter(|op| match op {
            Operation::Call(call) => {
                call.function == "grantRole" && call.args[0] == AbiValue::Bytes32(funder.clone())
            }
            _ => false,
        })
        .count();
    assert_eq!(funder_grants, 6);
}

#[tokio::test]
async fn test_follow_up_plan_from_archived_record() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());

    let core = PlanRunner::new(store.clone(), SimulatedLedger::new(), RetryPolicy::immediate(2));
    let run = core.run(&pangolin(), &env()).await.unwrap();

    let record = CheckpointStore::load_record(Path::new(run.record_path.as_deref().unwrap()))
        .await
        .unwrap();
    store.save(&env(), &record).await.unwrap();

    let start = Plan::from_file(&plan_file("start-vesting")).unwrap();
    let follow_up = PlanRunner::new(store, SimulatedLedger::new(), RetryPolicy::immediate(2));
    follow_up.run(&start, &env()).await.unwrap();

    let calls = follow_up.client().calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Operation::Call(call) => {
            assert_eq!(call.function, "unpause");
            assert_eq!(call.contract, record.get("TreasuryVester").unwrap().render());
            assert_eq!(call.gas, 32_000);
        }
        other => panic!("unexpected operation {:?}", other),
    }
}
