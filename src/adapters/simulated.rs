//! In-memory ledger for dry runs and tests.
//!
//! Creations get sequential ids and deterministic addresses, every
//! operation is logged, and failures can be injected per artifact or
//! function name. An operator balance, when set, pays a flat fee plus any
//! value sent for each committed transaction.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    AccountCreate, ChainClient, ContractCall, ContractCreate, ContractQuery, Created, Operation,
    Receipt, ReceiptStatus,
};
use crate::error::ChainError;

/// First entity number handed out, mirroring a shard/realm id layout
const FIRST_ENTITY: u64 = 1001;

/// Flat fee charged per transaction, in tinybar (0.05 hbar)
pub const TRANSACTION_FEE: u64 = 5_000_000;

#[derive(Debug)]
struct InjectedFailure {
    /// Artifact name or function name to match
    target: String,
    error: ChainError,
    /// `None` means fail forever
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_entity: u64,
    calls: Vec<Operation>,
    failures: Vec<InjectedFailure>,
    query_responses: HashMap<String, serde_json::Value>,
    call_results: HashMap<String, serde_json::Value>,
    offline: bool,
    balance: Option<u64>,
}

/// Deterministic in-memory chain client
#[derive(Debug)]
pub struct SimulatedLedger {
    state: Mutex<LedgerState>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_entity: FIRST_ENTITY,
                ..Default::default()
            }),
        }
    }

    /// A ledger that fails every call; any remote call is a test failure
    pub fn offline() -> Self {
        let ledger = Self::new();
        ledger.lock().offline = true;
        ledger
    }

    /// Give the operator account a starting balance in tinybar
    pub fn with_balance(self, tinybar: u64) -> Self {
        self.lock().balance = Some(tinybar);
        self
    }

    /// Address derived from an entity number
    pub fn address_of(entity: u64) -> String {
        format!("0x{:040x}", entity)
    }

    /// Fail the next `times` operations targeting `target`
    pub fn fail_on(&self, target: impl Into<String>, error: ChainError, times: u32) -> &Self {
        self.lock().failures.push(InjectedFailure {
            target: target.into(),
            error,
            remaining: Some(times),
        });
        self
    }

    /// Fail every operation targeting `target`
    pub fn fail_always(&self, target: impl Into<String>, error: ChainError) -> &Self {
        self.lock().failures.push(InjectedFailure {
            target: target.into(),
            error,
            remaining: None,
        });
        self
    }

    /// Remove all injected failures
    pub fn heal(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.offline = false;
    }

    /// Fixed value returned by queries of `function`
    pub fn respond_to_query(&self, function: impl Into<String>, value: serde_json::Value) -> &Self {
        self.lock().query_responses.insert(function.into(), value);
        self
    }

    /// Fixed return value of calls to `function`; otherwise calls return a
    /// fresh address
    pub fn respond_to_call(&self, function: impl Into<String>, value: serde_json::Value) -> &Self {
        self.lock().call_results.insert(function.into(), value);
        self
    }

    /// Every operation received, failed attempts included
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of operations received for an artifact or function name
    pub fn calls_to(&self, target: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|op| op.label() == target)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A poisoned lock only means a test thread panicked mid-call
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log the call and apply any injected failure
    fn admit(&self, op: Operation) -> Result<(), ChainError> {
        let mut state = self.lock();
        let label = op.label().to_string();
        state.calls.push(op);

        if state.offline {
            return Err(ChainError::Unavailable("simulated ledger is offline".into()));
        }

        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.target == label && f.remaining != Some(0))
        {
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(failure.error.clone());
        }

        Ok(())
    }

    /// Deduct the fee and `value` for a committed transaction
    fn charge(&self, value: u64) {
        let mut state = self.lock();
        if let Some(balance) = state.balance.as_mut() {
            *balance = balance.saturating_sub(TRANSACTION_FEE.saturating_add(value));
        }
    }

    fn allocate(&self) -> Created {
        let mut state = self.lock();
        let entity = state.next_entity;
        state.next_entity += 1;
        Created {
            id: format!("0.0.{}", entity),
            address: Self::address_of(entity),
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedLedger {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create_contract(&self, op: &ContractCreate) -> Result<Created, ChainError> {
        self.admit(Operation::CreateContract(op.clone()))?;
        self.charge(op.initial_balance);
        Ok(self.allocate())
    }

    async fn create_account(&self, op: &AccountCreate) -> Result<Created, ChainError> {
        self.admit(Operation::CreateAccount(op.clone()))?;
        self.charge(op.initial_balance);
        Ok(self.allocate())
    }

    async fn call_function(&self, op: &ContractCall) -> Result<Receipt, ChainError> {
        self.admit(Operation::Call(op.clone()))?;
        self.charge(op.payment.unwrap_or(0));
        let configured = self.lock().call_results.get(&op.function).cloned();
        let result = match configured {
            Some(value) => value,
            None => serde_json::Value::String(self.allocate().address),
        };
        Ok(Receipt {
            status: ReceiptStatus::Success,
            result: Some(result),
        })
    }

    async fn query_function(&self, op: &ContractQuery) -> Result<serde_json::Value, ChainError> {
        self.admit(Operation::Query(op.clone()))?;
        let configured = self.lock().query_responses.get(&op.function).cloned();
        match configured {
            Some(value) => Ok(value),
            None => Ok(serde_json::Value::String(self.allocate().address)),
        }
    }

    async fn balance(&self) -> Result<Option<u64>, ChainError> {
        Ok(self.lock().balance)
    }
}
