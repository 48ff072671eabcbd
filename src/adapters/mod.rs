//! Chain client interface and the operations it carries.
//!
//! The orchestrator never talks to a ledger SDK directly. Every remote side
//! effect is expressed as an [`Operation`] and handed to a [`ChainClient`].

pub mod command;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

pub use command::CommandClient;
pub use simulated::SimulatedLedger;

/// A typed, fully resolved function or constructor argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AbiValue {
    #[serde(rename = "address")]
    Address(String),

    /// Decimal string, wide enough for any uint256
    #[serde(rename = "uint256")]
    Uint256(String),

    #[serde(rename = "uint8")]
    Uint8(u8),

    #[serde(rename = "int64")]
    Int64(i64),

    #[serde(rename = "bool")]
    Bool(bool),

    #[serde(rename = "string")]
    String(String),

    /// 0x-prefixed, 64 hex digits
    #[serde(rename = "bytes32")]
    Bytes32(String),

    /// 0x-prefixed hex of any length
    #[serde(rename = "bytes")]
    Bytes(String),

    #[serde(rename = "address[]")]
    AddressArray(Vec<String>),

    #[serde(rename = "int64[]")]
    Int64Array(Vec<i64>),
}

/// Deploy a contract from a compiled artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreate {
    /// Artifact name; the client resolves it to bytecode
    pub artifact: String,
    #[serde(default)]
    pub constructor_args: Vec<AbiValue>,
    pub gas: u64,
    /// Funds sent with the creation, in the ledger's smallest unit
    #[serde(default)]
    pub initial_balance: u64,
}

/// Create a ledger account (single key or threshold key list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCreate {
    #[serde(default)]
    pub initial_balance: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
}

/// State-changing contract call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<AbiValue>,
    pub gas: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<u64>,
}

/// Read-only contract call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractQuery {
    pub contract: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<AbiValue>,
    pub gas: u64,
}

/// A single remote operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    CreateContract(ContractCreate),
    CreateAccount(AccountCreate),
    Call(ContractCall),
    Query(ContractQuery),
    /// Operator account balance, answered with a `value` in the smallest unit
    Balance,
}

impl Operation {
    /// Short label for logs: artifact name or function name
    pub fn label(&self) -> &str {
        match self {
            Self::CreateContract(op) => &op.artifact,
            Self::CreateAccount(_) => "account",
            Self::Call(op) => &op.function,
            Self::Query(op) => &op.function,
            Self::Balance => "balance",
        }
    }
}

/// Identity of a newly created contract or account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    /// Ledger-native id (e.g. `0.0.1234`)
    pub id: String,
    /// 0x-prefixed address
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Success,
    #[serde(untagged)]
    Other(String),
}

/// Result of a state-changing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Receipt {
    pub fn success() -> Self {
        Self {
            status: ReceiptStatus::Success,
            result: None,
        }
    }
}

/// Output of any operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutput {
    Created(Created),
    Receipt(Receipt),
    Value { value: serde_json::Value },
}

/// Boundary through which all remote side effects occur
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Human-readable client name
    fn name(&self) -> &str;

    async fn create_contract(&self, op: &ContractCreate) -> Result<Created, ChainError>;

    async fn create_account(&self, op: &AccountCreate) -> Result<Created, ChainError>;

    async fn call_function(&self, op: &ContractCall) -> Result<Receipt, ChainError>;

    async fn query_function(&self, op: &ContractQuery) -> Result<serde_json::Value, ChainError>;

    /// Operator account balance in the ledger's smallest unit, if the
    /// client can tell
    async fn balance(&self) -> Result<Option<u64>, ChainError> {
        Ok(None)
    }

    /// Dispatch an operation to the matching call
    async fn submit(&self, op: &Operation) -> Result<OperationOutput, ChainError> {
        match op {
            Operation::CreateContract(op) => self.create_contract(op).await.map(OperationOutput::Created),
            Operation::CreateAccount(op) => self.create_account(op).await.map(OperationOutput::Created),
            Operation::Call(op) => self.call_function(op).await.map(OperationOutput::Receipt),
            Operation::Query(op) => self
                .query_function(op)
                .await
                .map(|value| OperationOutput::Value { value }),
            Operation::Balance => self.balance().await.map(|balance| OperationOutput::Value {
                value: serde_json::json!(balance),
            }),
        }
    }
}
