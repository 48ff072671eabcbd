//! Deployment plan definitions and loading.
//!
//! Plans are defined in YAML and consist of ordered steps. Each step either
//! creates something and records its value under a key, or performs an
//! idempotent action recorded by a description under `"config"`.
//!
//! String arguments may reference previously recorded values as `${Key}`.
//! Every such reference is an implicit dependency of the step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::adapters::{
    AbiValue, AccountCreate, ContractCall, ContractCreate, ContractQuery, Operation,
    OperationOutput, ReceiptStatus,
};
use crate::domain::{Checkpoint, RecordKey, StepResult, CONFIG_KEY};
use crate::error::{ChainError, DeployError};

use super::roles::role_hash;

const DEFAULT_ROLE_GAS: u64 = 200_000;
const DEFAULT_APPROVE_GAS: u64 = 900_000;
const DEFAULT_PAUSE_GAS: u64 = 32_000;

/// A complete deployment plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan name (used in CLI and logs)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Values recorded into the checkpoint before the first step, without
    /// any remote call (pre-existing accounts, operator addresses)
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load plan: {}", path.display()))
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse plan YAML")
    }

    /// Validate the plan definition.
    ///
    /// A dependency produced by a step must be produced by an earlier one;
    /// forward references are rejected. Keys that no step produces are
    /// external and must be in the checkpoint by the time they are needed.
    ///
    /// An input may name a key a step also produces. The input is recorded
    /// first, so the step is skipped and the existing value reused.
    pub fn validate(&self) -> Result<(), DeployError> {
        let invalid = |msg: String| -> Result<(), DeployError> { Err(DeployError::InvalidPlan(msg)) };

        if self.name.trim().is_empty() {
            return invalid("plan name cannot be empty".into());
        }

        if self.steps.is_empty() {
            return invalid(format!("plan '{}' has no steps", self.name));
        }

        for key in self.inputs.keys() {
            if key.is_empty() || key == CONFIG_KEY {
                return invalid(format!("'{}' cannot be used as an input key", key));
            }
        }

        // Position of the step producing each key
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(key) = step.result_key() {
                if key.is_empty() || key == CONFIG_KEY {
                    return invalid(format!("step {} cannot record under '{}'", i + 1, key));
                }
                if producers.insert(key, i).is_some() {
                    return invalid(format!("key '{}' is produced by more than one step", key));
                }
            }
        }

        // Two actions recorded under one description would make the second
        // look done as soon as the first commits
        let mut descriptions: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if let Some(description) = step.explicit_description() {
                if !descriptions.insert(description) {
                    return invalid(format!(
                        "description '{}' is used by more than one step",
                        description
                    ));
                }
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            step.check_templates()?;

            for dep in step.dependencies() {
                if self.inputs.contains_key(&dep) {
                    continue;
                }
                match producers.get(dep.as_str()) {
                    Some(&idx) if idx >= i => {
                        return invalid(format!(
                            "step '{}' references '{}' before it is produced (forward references not allowed)",
                            step.label(),
                            dep
                        ));
                    }
                    // Earlier producer, or an external key checked when the step runs
                    Some(_) | None => {}
                }
            }
        }

        Ok(())
    }

    /// Short content hash identifying this exact plan (16 hex chars)
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(&digest[..8])
    }

    /// Keys referenced by steps that neither an input nor a step provides
    pub fn external_dependencies(&self) -> Vec<String> {
        let mut external: Vec<String> = Vec::new();
        for step in &self.steps {
            for dep in step.dependencies() {
                if !self.inputs.contains_key(&dep)
                    && self.get_step(&dep).is_none()
                    && !external.contains(&dep)
                {
                    external.push(dep);
                }
            }
        }
        external
    }

    /// Get a creation step by the key it records
    pub fn get_step(&self, key: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.result_key() == Some(key))
    }
}

/// A single step in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: StepAction,

    /// Keys that must be recorded before this step runs, in addition to
    /// those referenced by `${Key}` templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Deploy a contract; records its address
    CreateContract(CreateContractSpec),

    /// Create a ledger account; records its address
    CreateAccount(CreateAccountSpec),

    /// Read a value from a contract; records the decoded value
    Query(QuerySpec),

    /// Arbitrary state-changing call, recorded as done or, with a `key`,
    /// by its return value
    Call(CallSpec),

    GrantRole(RoleSpec),

    RenounceRole(RoleSpec),

    /// Parameterless `approve()` on the contract
    Approve(ContractActionSpec),

    Pause(ContractActionSpec),

    Unpause(ContractActionSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContractSpec {
    pub key: String,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
    pub gas: u64,
    #[serde(default)]
    pub initial_balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAccountSpec {
    pub key: String,
    #[serde(default)]
    pub initial_balance: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub key: String,
    pub contract: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
    pub gas: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    /// Record the call's return value under this key instead of marking
    /// the call done under a description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub contract: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
    pub gas: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub contract: String,
    pub role: String,
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractActionSpec {
    pub contract: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Function or constructor argument as written in a plan.
///
/// String-valued arguments may contain `${Key}` templates.
///
/// ```yaml
/// args:
///   - { type: address, value: "${Timelock}" }
///   - { type: uint256, value: 172800 }
///   - { type: role, value: FUNDER_ROLE }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Arg {
    #[serde(rename = "address")]
    Address(String),

    #[serde(rename = "uint256")]
    Uint256(#[serde(deserialize_with = "numeric")] String),

    #[serde(rename = "uint8")]
    Uint8(u8),

    #[serde(rename = "int64")]
    Int64(#[serde(deserialize_with = "numeric")] String),

    #[serde(rename = "bool")]
    Bool(bool),

    #[serde(rename = "string")]
    String(String),

    #[serde(rename = "bytes32")]
    Bytes32(String),

    /// Role name, hashed to bytes32
    #[serde(rename = "role")]
    Role(String),

    /// Raw bytes, 0x-prefixed hex
    #[serde(rename = "bytes")]
    Bytes(String),

    /// ABI encoding of the nested arguments, passed as `bytes`.
    /// Only static types (address, integers, bool, bytes32, role) nest.
    #[serde(rename = "abi")]
    Encoded(Vec<Arg>),

    #[serde(rename = "address[]")]
    AddressArray(Vec<String>),

    #[serde(rename = "int64[]")]
    Int64Array(Vec<i64>),
}

/// Accept YAML numbers or strings for numeric arguments
fn numeric<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Unsigned(u64),
        Signed(i64),
        Text(String),
    }

    Ok(match Numeric::deserialize(deserializer)? {
        Numeric::Unsigned(n) => n.to_string(),
        Numeric::Signed(n) => n.to_string(),
        Numeric::Text(s) => s,
    })
}

impl Arg {
    fn templates(&self) -> Vec<&str> {
        match self {
            Self::Address(s)
            | Self::Uint256(s)
            | Self::Int64(s)
            | Self::String(s)
            | Self::Bytes32(s)
            | Self::Bytes(s)
            | Self::Role(s) => vec![s.as_str()],
            Self::Encoded(items) => items.iter().flat_map(Arg::templates).collect(),
            Self::AddressArray(items) => items.iter().map(String::as_str).collect(),
            Self::Uint8(_) | Self::Bool(_) | Self::Int64Array(_) => Vec::new(),
        }
    }

    fn resolve(&self, checkpoint: &Checkpoint, step: &str) -> Result<AbiValue, DeployError> {
        let sub = |s: &str| substitute(s, checkpoint, step);
        let bad = |message: String| DeployError::Template {
            step: step.to_string(),
            message,
        };

        Ok(match self {
            Self::Address(s) => AbiValue::Address(sub(s)?),
            Self::Uint256(s) => {
                let value = sub(s)?;
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
                    return Err(bad(format!("'{}' is not an unsigned integer", value)));
                }
                AbiValue::Uint256(value)
            }
            Self::Int64(s) => {
                let value = sub(s)?;
                let parsed = value
                    .parse::<i64>()
                    .map_err(|_| bad(format!("'{}' is not a 64-bit integer", value)))?;
                AbiValue::Int64(parsed)
            }
            Self::Uint8(n) => AbiValue::Uint8(*n),
            Self::Bool(b) => AbiValue::Bool(*b),
            Self::String(s) => AbiValue::String(sub(s)?),
            Self::Bytes32(s) => AbiValue::Bytes32(sub(s)?),
            Self::Role(s) => AbiValue::Bytes32(role_hash(&sub(s)?)),
            Self::Bytes(s) => {
                let value = sub(s)?;
                let valid = value
                    .strip_prefix("0x")
                    .map(|digits| hex::decode(digits).is_ok())
                    .unwrap_or(false);
                if !valid {
                    return Err(bad(format!("'{}' is not 0x-prefixed hex", value)));
                }
                AbiValue::Bytes(value.to_ascii_lowercase())
            }
            Self::Encoded(items) => {
                let mut data: Vec<u8> = Vec::with_capacity(32 * items.len());
                for item in items {
                    let word = abi_word(&item.resolve(checkpoint, step)?).map_err(bad)?;
                    data.extend_from_slice(word.as_slice());
                }
                AbiValue::Bytes(format!("0x{}", hex::encode(data)))
            }
            Self::AddressArray(items) => AbiValue::AddressArray(
                items.iter().map(|s| sub(s)).collect::<Result<Vec<_>, _>>()?,
            ),
            Self::Int64Array(items) => AbiValue::Int64Array(items.clone()),
        })
    }
}

impl Step {
    fn new(action: StepAction) -> Self {
        Self {
            action,
            depends_on: Vec::new(),
        }
    }

    pub fn create_contract(key: impl Into<String>, artifact: impl Into<String>, gas: u64) -> Self {
        Self::new(StepAction::CreateContract(CreateContractSpec {
            key: key.into(),
            artifact: artifact.into(),
            args: Vec::new(),
            gas,
            initial_balance: 0,
        }))
    }

    pub fn create_account(key: impl Into<String>, initial_balance: u64) -> Self {
        Self::new(StepAction::CreateAccount(CreateAccountSpec {
            key: key.into(),
            initial_balance,
            threshold: None,
        }))
    }

    pub fn query(
        key: impl Into<String>,
        contract: impl Into<String>,
        function: impl Into<String>,
        gas: u64,
    ) -> Self {
        Self::new(StepAction::Query(QuerySpec {
            key: key.into(),
            contract: contract.into(),
            function: function.into(),
            args: Vec::new(),
            gas,
        }))
    }

    pub fn call(contract: impl Into<String>, function: impl Into<String>, gas: u64) -> Self {
        Self::new(StepAction::Call(CallSpec {
            key: None,
            contract: contract.into(),
            function: function.into(),
            args: Vec::new(),
            gas,
            payment: None,
            description: None,
        }))
    }

    pub fn grant_role(
        contract: impl Into<String>,
        role: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self::new(StepAction::GrantRole(RoleSpec {
            contract: contract.into(),
            role: role.into(),
            account: account.into(),
            gas: None,
            description: None,
        }))
    }

    pub fn renounce_role(
        contract: impl Into<String>,
        role: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self::new(StepAction::RenounceRole(RoleSpec {
            contract: contract.into(),
            role: role.into(),
            account: account.into(),
            gas: None,
            description: None,
        }))
    }

    pub fn approve(contract: impl Into<String>) -> Self {
        Self::new(StepAction::Approve(Self::contract_action(contract)))
    }

    pub fn pause(contract: impl Into<String>) -> Self {
        Self::new(StepAction::Pause(Self::contract_action(contract)))
    }

    pub fn unpause(contract: impl Into<String>) -> Self {
        Self::new(StepAction::Unpause(Self::contract_action(contract)))
    }

    fn contract_action(contract: impl Into<String>) -> ContractActionSpec {
        ContractActionSpec {
            contract: contract.into(),
            gas: None,
            description: None,
        }
    }

    /// Set constructor, call or query arguments
    pub fn with_args(mut self, args: Vec<Arg>) -> Self {
        match &mut self.action {
            StepAction::CreateContract(spec) => spec.args = args,
            StepAction::Query(spec) => spec.args = args,
            StepAction::Call(spec) => spec.args = args,
            _ => {}
        }
        self
    }

    pub fn with_initial_balance(mut self, amount: u64) -> Self {
        match &mut self.action {
            StepAction::CreateContract(spec) => spec.initial_balance = amount,
            StepAction::CreateAccount(spec) => spec.initial_balance = amount,
            _ => {}
        }
        self
    }

    /// Override the description an action is recorded under
    pub fn described_as(mut self, description: impl Into<String>) -> Self {
        let description = Some(description.into());
        match &mut self.action {
            StepAction::Call(spec) => spec.description = description,
            StepAction::GrantRole(spec) | StepAction::RenounceRole(spec) => {
                spec.description = description
            }
            StepAction::Approve(spec) | StepAction::Pause(spec) | StepAction::Unpause(spec) => {
                spec.description = description
            }
            _ => {}
        }
        self
    }

    /// Record a call's return value under `key`
    pub fn recording(mut self, key: impl Into<String>) -> Self {
        if let StepAction::Call(spec) = &mut self.action {
            spec.key = Some(key.into());
        }
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    /// Key recorded by a creation step; `None` for idempotent actions
    pub fn result_key(&self) -> Option<&str> {
        match &self.action {
            StepAction::CreateContract(spec) => Some(&spec.key),
            StepAction::CreateAccount(spec) => Some(&spec.key),
            StepAction::Query(spec) => Some(&spec.key),
            StepAction::Call(spec) => spec.key.as_deref(),
            _ => None,
        }
    }

    pub fn is_action(&self) -> bool {
        self.result_key().is_none()
    }

    /// Name for logs, available before any template is resolved
    pub fn label(&self) -> String {
        if let Some(key) = self.result_key() {
            return key.to_string();
        }
        if let Some(description) = self.explicit_description() {
            return description.to_string();
        }
        match &self.action {
            StepAction::Call(spec) => format!("call {} on {}", spec.function, spec.contract),
            StepAction::GrantRole(spec) => {
                format!("grant {} to {} on {}", spec.role, spec.account, spec.contract)
            }
            StepAction::RenounceRole(spec) => {
                format!("renounce {} from {} on {}", spec.role, spec.account, spec.contract)
            }
            StepAction::Approve(spec) => format!("approve {}", spec.contract),
            StepAction::Pause(spec) => format!("pause {}", spec.contract),
            StepAction::Unpause(spec) => format!("unpause {}", spec.contract),
            StepAction::CreateContract(_) | StepAction::CreateAccount(_) | StepAction::Query(_) => {
                String::new()
            }
        }
    }

    fn explicit_description(&self) -> Option<&str> {
        match &self.action {
            StepAction::Call(spec) => spec.description.as_deref(),
            StepAction::GrantRole(spec) | StepAction::RenounceRole(spec) => {
                spec.description.as_deref()
            }
            StepAction::Approve(spec) | StepAction::Pause(spec) | StepAction::Unpause(spec) => {
                spec.description.as_deref()
            }
            _ => None,
        }
    }

    /// Every string that may carry `${Key}` templates
    fn template_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        match &self.action {
            StepAction::CreateContract(spec) => {
                fields.extend(spec.args.iter().flat_map(Arg::templates));
            }
            StepAction::CreateAccount(_) => {}
            StepAction::Query(spec) => {
                fields.push(&spec.contract);
                fields.extend(spec.args.iter().flat_map(Arg::templates));
            }
            StepAction::Call(spec) => {
                fields.push(&spec.contract);
                fields.extend(spec.args.iter().flat_map(Arg::templates));
            }
            StepAction::GrantRole(spec) | StepAction::RenounceRole(spec) => {
                fields.push(&spec.contract);
                fields.push(&spec.role);
                fields.push(&spec.account);
            }
            StepAction::Approve(spec) | StepAction::Pause(spec) | StepAction::Unpause(spec) => {
                fields.push(&spec.contract);
            }
        }
        if let Some(description) = self.explicit_description() {
            fields.push(description);
        }
        fields
    }

    fn check_templates(&self) -> Result<(), DeployError> {
        for field in self.template_fields() {
            template_refs(field).map_err(|message| DeployError::Template {
                step: self.label(),
                message,
            })?;
        }
        Ok(())
    }

    /// Checkpoint keys this step reads, in first-use order
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.depends_on.clone();
        for field in self.template_fields() {
            for key in template_refs(field).unwrap_or_default() {
                if !deps.iter().any(|d| d == key) {
                    deps.push(key.to_string());
                }
            }
        }
        deps
    }

    /// Fail with an ordering error if any dependency is unrecorded
    pub fn check_dependencies(&self, checkpoint: &Checkpoint) -> Result<(), DeployError> {
        match self
            .dependencies()
            .into_iter()
            .find(|key| !checkpoint.contains_result(key))
        {
            Some(key) => Err(DeployError::MissingDependency {
                step: self.label(),
                key,
            }),
            None => Ok(()),
        }
    }

    /// Where this step's completion is recorded.
    ///
    /// Action descriptions are built from resolved values, so this needs
    /// the dependencies of an action step to be present.
    pub fn record_key(&self, checkpoint: &Checkpoint) -> Result<RecordKey, DeployError> {
        if let Some(key) = self.result_key() {
            return Ok(RecordKey::Result(key.to_string()));
        }

        self.check_dependencies(checkpoint)?;
        let label = self.label();
        let sub = |s: &str| substitute(s, checkpoint, &label);

        if let Some(description) = self.explicit_description() {
            return Ok(RecordKey::Action(sub(description)?));
        }

        let description = match &self.action {
            StepAction::Call(spec) => {
                let args = spec
                    .args
                    .iter()
                    .map(|arg| arg.resolve(checkpoint, &label).map(|v| render_abi(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                format!(
                    "Call {}({}) on {}",
                    spec.function,
                    args.join(", "),
                    sub(&spec.contract)?
                )
            }
            StepAction::GrantRole(spec) => format!(
                "Grant {} to {} on {}",
                sub(&spec.role)?,
                sub(&spec.account)?,
                sub(&spec.contract)?
            ),
            StepAction::RenounceRole(spec) => format!(
                "Renounce {} from {} on {}",
                sub(&spec.role)?,
                sub(&spec.account)?,
                sub(&spec.contract)?
            ),
            StepAction::Approve(spec) => format!("Approve {}", sub(&spec.contract)?),
            StepAction::Pause(spec) => format!("Pause {}", sub(&spec.contract)?),
            StepAction::Unpause(spec) => format!("Unpause {}", sub(&spec.contract)?),
            StepAction::CreateContract(_) | StepAction::CreateAccount(_) | StepAction::Query(_) => {
                unreachable!("creation steps return early")
            }
        };

        Ok(RecordKey::Action(description))
    }

    /// Build the remote operation from the current checkpoint snapshot
    pub fn operation(&self, checkpoint: &Checkpoint) -> Result<Operation, DeployError> {
        self.check_dependencies(checkpoint)?;

        let label = self.label();
        let sub = |s: &str| substitute(s, checkpoint, &label);
        let args = |args: &[Arg]| {
            args.iter()
                .map(|arg| arg.resolve(checkpoint, &label))
                .collect::<Result<Vec<_>, _>>()
        };

        let op = match &self.action {
            StepAction::CreateContract(spec) => Operation::CreateContract(ContractCreate {
                artifact: spec.artifact.clone(),
                constructor_args: args(&spec.args)?,
                gas: spec.gas,
                initial_balance: spec.initial_balance,
            }),
            StepAction::CreateAccount(spec) => Operation::CreateAccount(AccountCreate {
                initial_balance: spec.initial_balance,
                threshold: spec.threshold,
            }),
            StepAction::Query(spec) => Operation::Query(ContractQuery {
                contract: sub(&spec.contract)?,
                function: spec.function.clone(),
                args: args(&spec.args)?,
                gas: spec.gas,
            }),
            StepAction::Call(spec) => Operation::Call(ContractCall {
                contract: sub(&spec.contract)?,
                function: spec.function.clone(),
                args: args(&spec.args)?,
                gas: spec.gas,
                payment: spec.payment,
            }),
            StepAction::GrantRole(spec) | StepAction::RenounceRole(spec) => {
                let function = if matches!(self.action, StepAction::GrantRole(_)) {
                    "grantRole"
                } else {
                    "renounceRole"
                };
                Operation::Call(ContractCall {
                    contract: sub(&spec.contract)?,
                    function: function.to_string(),
                    args: vec![
                        AbiValue::Bytes32(role_hash(&sub(&spec.role)?)),
                        AbiValue::Address(sub(&spec.account)?),
                    ],
                    gas: spec.gas.unwrap_or(DEFAULT_ROLE_GAS),
                    payment: None,
                })
            }
            StepAction::Approve(spec) => Self::bare_call(spec, "approve", DEFAULT_APPROVE_GAS, &sub)?,
            StepAction::Pause(spec) => Self::bare_call(spec, "pause", DEFAULT_PAUSE_GAS, &sub)?,
            StepAction::Unpause(spec) => Self::bare_call(spec, "unpause", DEFAULT_PAUSE_GAS, &sub)?,
        };

        Ok(op)
    }

    fn bare_call(
        spec: &ContractActionSpec,
        function: &str,
        default_gas: u64,
        sub: &dyn Fn(&str) -> Result<String, DeployError>,
    ) -> Result<Operation, DeployError> {
        Ok(Operation::Call(ContractCall {
            contract: sub(&spec.contract)?,
            function: function.to_string(),
            args: Vec::new(),
            gas: spec.gas.unwrap_or(default_gas),
            payment: None,
        }))
    }

    /// Turn the ledger's answer into the value to record
    pub fn decode(&self, output: OperationOutput) -> Result<StepResult, DeployError> {
        let unexpected = |expected: &'static str| DeployError::UnexpectedOutput {
            step: self.label(),
            expected,
        };

        match (&self.action, output) {
            (
                StepAction::CreateContract(_) | StepAction::CreateAccount(_),
                OperationOutput::Created(created),
            ) => Ok(StepResult::Text(created.address)),
            (StepAction::CreateContract(_) | StepAction::CreateAccount(_), _) => {
                Err(unexpected("creation"))
            }
            (StepAction::Query(_), OperationOutput::Value { value }) => Ok(value_result(value)),
            (StepAction::Query(_), _) => Err(unexpected("query value")),
            (StepAction::Call(spec), OperationOutput::Receipt(receipt)) if spec.key.is_some() => {
                match (receipt.status, receipt.result) {
                    (ReceiptStatus::Success, Some(value)) => Ok(value_result(value)),
                    (ReceiptStatus::Success, None) => Err(unexpected("call return value")),
                    (ReceiptStatus::Other(status), _) => Err(DeployError::Rejected {
                        step: self.label(),
                        source: ChainError::Rejected(format!("receipt status {}", status)),
                    }),
                }
            }
            (_, OperationOutput::Receipt(receipt)) => match receipt.status {
                ReceiptStatus::Success => Ok(StepResult::Flag(true)),
                ReceiptStatus::Other(status) => Err(DeployError::Rejected {
                    step: self.label(),
                    source: ChainError::Rejected(format!("receipt status {}", status)),
                }),
            },
            (_, _) => Err(unexpected("receipt")),
        }
    }
}

/// Parse the `${Key}` references in a template
fn template_refs(template: &str) -> Result<Vec<&str>, String> {
    let mut refs = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated '${{' in '{}'", template))?;
        let key = &after[..end];
        if key.is_empty() {
            return Err(format!("empty reference in '{}'", template));
        }
        refs.push(key);
        rest = &after[end + 1..];
    }

    Ok(refs)
}

/// Replace every `${Key}` with the recorded value
fn substitute(template: &str, checkpoint: &Checkpoint, step: &str) -> Result<String, DeployError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| DeployError::Template {
            step: step.to_string(),
            message: format!("unterminated '${{' in '{}'", template),
        })?;
        let key = &after[..end];
        let value = checkpoint
            .get(key)
            .ok_or_else(|| DeployError::MissingDependency {
                step: step.to_string(),
                key: key.to_string(),
            })?;
        out.push_str(&value.render());
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn value_result(value: serde_json::Value) -> StepResult {
    match value {
        serde_json::Value::String(s) => StepResult::Text(s),
        serde_json::Value::Bool(b) => StepResult::Flag(b),
        other => StepResult::Other(other),
    }
}

fn render_abi(value: &AbiValue) -> String {
    match value {
        AbiValue::Address(s)
        | AbiValue::Uint256(s)
        | AbiValue::String(s)
        | AbiValue::Bytes32(s)
        | AbiValue::Bytes(s) => s.clone(),
        AbiValue::Uint8(n) => n.to_string(),
        AbiValue::Int64(n) => n.to_string(),
        AbiValue::Bool(b) => b.to_string(),
        AbiValue::AddressArray(items) => format!("[{}]", items.join(", ")),
        AbiValue::Int64Array(items) => format!(
            "[{}]",
            items.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// One 32-byte head word of the standard ABI encoding
fn abi_word(value: &AbiValue) -> Result<B256, String> {
    let mut word = [0u8; 32];
    match value {
        AbiValue::Address(s) => {
            let address = s
                .parse::<Address>()
                .map_err(|_| format!("'{}' is not a 20-byte address", s))?;
            return Ok(address.into_word());
        }
        AbiValue::Uint256(s) => {
            let n = s
                .parse::<U256>()
                .map_err(|_| format!("'{}' does not fit in uint256", s))?;
            word = n.to_be_bytes::<32>();
        }
        AbiValue::Uint8(n) => word[31] = *n,
        AbiValue::Int64(n) => {
            if *n < 0 {
                word = [0xff; 32];
            }
            word[24..].copy_from_slice(&n.to_be_bytes());
        }
        AbiValue::Bool(b) => word[31] = u8::from(*b),
        AbiValue::Bytes32(s) => {
            return s
                .parse::<B256>()
                .map_err(|_| format!("'{}' is not 32 bytes of hex", s));
        }
        AbiValue::String(_)
        | AbiValue::Bytes(_)
        | AbiValue::AddressArray(_)
        | AbiValue::Int64Array(_) => {
            return Err(format!("{} is dynamic and cannot be nested in abi", render_abi(value)));
        }
    }
    Ok(B256::from(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Created, Receipt};

    const TEST_PLAN_YAML: &str = r#"
name: core
description: Core contracts

inputs:
  Multisig: "0x00000000000000000000000000000000000000aa"

steps:
  - action: create_contract
    key: Timelock
    artifact: Timelock
    gas: 100000
    args:
      - { type: address, value: "${Multisig}" }
      - { type: uint256, value: 172800 }

  - action: query
    key: "WHBAR (HTS)"
    contract: "${Timelock}"
    function: TOKEN_ID
    gas: 24000

  - action: grant_role
    contract: "${Timelock}"
    role: FUNDER_ROLE
    account: "${Multisig}"

  - action: unpause
    contract: "${Timelock}"
    depends_on: ["WHBAR (HTS)"]
"#;

    fn checkpoint() -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Multisig", "0xaa");
        checkpoint.insert("Timelock", "0x01");
        checkpoint
    }

    #[test]
    fn test_plan_parsing() {
        let plan = Plan::from_yaml(TEST_PLAN_YAML).unwrap();

        assert_eq!(plan.name, "core");
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.steps[0].result_key(), Some("Timelock"));
        assert!(plan.steps[2].is_action());

        match &plan.steps[0].action {
            StepAction::CreateContract(spec) => {
                assert_eq!(spec.args[1], Arg::Uint256("172800".into()));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_plan_validation() {
        let plan = Plan::from_yaml(TEST_PLAN_YAML).unwrap();
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let plan = Plan::new("fwd")
            .step(Step::grant_role("${Chef}", "FUNDER_ROLE", "0x01"))
            .step(Step::create_contract("Chef", "PangoChef", 100_000));

        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("forward references"));
    }

    #[test]
    fn test_external_reference_allowed() {
        let plan = Plan::new("external")
            .with_input("Multisig", "0xaa")
            .step(Step::approve("${Forwarder}"))
            .step(Step::grant_role("${Forwarder}", "PAUSE_ROLE", "${Multisig}"));
        assert!(plan.validate().is_ok());
        assert_eq!(plan.external_dependencies(), vec!["Forwarder"]);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let plan = Plan::new("dup")
            .step(Step::create_contract("Factory", "PangolinFactory", 1))
            .step(Step::create_contract("Factory", "PangolinFactory", 1));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_duplicate_descriptions_rejected() {
        let plan = Plan::new("vester")
            .step(Step::create_contract("TreasuryVester", "TreasuryVester", 1))
            .step(Step::call("${TreasuryVester}", "setRecipients", 1).described_as("Configure vester"))
            .step(Step::unpause("${TreasuryVester}").described_as("Configure vester"));

        let err = plan.validate().unwrap_err();
        assert!(matches!(err, DeployError::InvalidPlan(_)));
        assert!(err.to_string().contains("Configure vester"));
    }

    #[test]
    fn test_input_may_stand_in_for_step() {
        let plan = Plan::new("reuse")
            .with_input("Multisig", "0xaa")
            .step(Step::create_account("Multisig", 10))
            .step(Step::create_contract("Timelock", "Timelock", 1)
                .with_args(vec![Arg::Address("${Multisig}".into())]));

        assert!(plan.validate().is_ok());
        assert!(plan.external_dependencies().is_empty());
    }

    #[test]
    fn test_config_key_is_reserved() {
        let plan = Plan::new("reserved").step(Step::create_account("config", 10));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_unterminated_template_rejected() {
        let plan = Plan::new("broken").step(Step::approve("${Chef"));
        assert!(matches!(plan.validate(), Err(DeployError::Template { .. })));
    }

    #[test]
    fn test_dependencies_include_templates() {
        let step = Step::grant_role("${Chef}", "FUNDER_ROLE", "${Multisig}").depends_on("Timelock");
        assert_eq!(step.dependencies(), vec!["Timelock", "Chef", "Multisig"]);
    }

    #[test]
    fn test_grant_role_operation() {
        let step = Step::grant_role("${Timelock}", "DEFAULT_ADMIN_ROLE", "${Multisig}");
        let op = step.operation(&checkpoint()).unwrap();

        match op {
            Operation::Call(call) => {
                assert_eq!(call.contract, "0x01");
                assert_eq!(call.function, "grantRole");
                assert_eq!(call.gas, DEFAULT_ROLE_GAS);
                assert_eq!(
                    call.args,
                    vec![
                        AbiValue::Bytes32(format!("0x{}", "0".repeat(64))),
                        AbiValue::Address("0xaa".into()),
                    ]
                );
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_operation_requires_dependencies() {
        let step = Step::approve("${Forwarder}");
        let err = step.operation(&checkpoint()).unwrap_err();
        assert!(matches!(
            err,
            DeployError::MissingDependency { ref key, .. } if key == "Forwarder"
        ));
    }

    #[test]
    fn test_action_descriptions_are_distinct_per_principal() {
        let a = Step::grant_role("${Timelock}", "FUNDER_ROLE", "0xabc");
        let b = Step::grant_role("${Timelock}", "FUNDER_ROLE", "0xdef");

        let key_a = a.record_key(&checkpoint()).unwrap();
        let key_b = b.record_key(&checkpoint()).unwrap();

        assert_eq!(key_a, RecordKey::Action("Grant FUNDER_ROLE to 0xabc on 0x01".into()));
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_explicit_description_is_templated() {
        let step = Step::call("${Timelock}", "transferOwnership", 35_000)
            .with_args(vec![Arg::Address("${Multisig}".into())])
            .described_as("Transfer ${Timelock} to multisig");
        assert_eq!(
            step.record_key(&checkpoint()).unwrap(),
            RecordKey::Action("Transfer 0x01 to multisig".into())
        );
    }

    #[test]
    fn test_call_description_includes_args() {
        let step = Step::call("${Timelock}", "initializePool", 200_000).with_args(vec![
            Arg::Address("${Multisig}".into()),
            Arg::Uint256("2".into()),
        ]);
        assert_eq!(
            step.record_key(&checkpoint()).unwrap().name(),
            "Call initializePool(0xaa, 2) on 0x01"
        );
    }

    #[test]
    fn test_invalid_numeric_argument() {
        let step = Step::create_contract("Vester", "TreasuryVester", 1)
            .with_args(vec![Arg::Uint256("${Multisig}".into())]);
        assert!(matches!(
            step.operation(&checkpoint()),
            Err(DeployError::Template { .. })
        ));
    }

    #[test]
    fn test_abi_encoded_argument() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Governor", "0x00000000000000000000000000000000000003F2");

        let arg = Arg::Encoded(vec![
            Arg::Address("${Governor}".into()),
            Arg::Uint256("2".into()),
            Arg::Int64("-1".into()),
        ]);
        assert_eq!(arg.templates(), vec!["${Governor}", "2", "-1"]);

        let expected = format!("0x{}3f2{}2{}", "0".repeat(61), "0".repeat(63), "f".repeat(64));
        assert_eq!(arg.resolve(&checkpoint, "queue").unwrap(), AbiValue::Bytes(expected));
    }

    #[test]
    fn test_abi_rejects_dynamic_members() {
        let arg = Arg::Encoded(vec![Arg::String("setPendingAdmin(address)".into())]);
        assert!(matches!(
            arg.resolve(&Checkpoint::new(), "queue"),
            Err(DeployError::Template { .. })
        ));
    }

    #[test]
    fn test_bytes_argument_must_be_hex() {
        assert_eq!(
            Arg::Bytes("0xABCD".into()).resolve(&Checkpoint::new(), "raw").unwrap(),
            AbiValue::Bytes("0xabcd".into())
        );
        assert!(Arg::Bytes("abcd".into()).resolve(&Checkpoint::new(), "raw").is_err());
        assert!(Arg::Bytes("0xabc".into()).resolve(&Checkpoint::new(), "raw").is_err());
    }

    #[test]
    fn test_decode_outputs() {
        let create = Step::create_contract("Factory", "PangolinFactory", 1);
        let created = OperationOutput::Created(Created {
            id: "0.0.7".into(),
            address: "0x07".into(),
        });
        assert_eq!(create.decode(created).unwrap(), StepResult::from("0x07"));
        assert!(create
            .decode(OperationOutput::Receipt(Receipt::success()))
            .is_err());

        let grant = Step::grant_role("0x01", "FUNDER_ROLE", "0x02");
        assert_eq!(
            grant
                .decode(OperationOutput::Receipt(Receipt::success()))
                .unwrap(),
            StepResult::Flag(true)
        );

        let reverted = OperationOutput::Receipt(Receipt {
            status: ReceiptStatus::Other("CONTRACT_REVERT_EXECUTED".into()),
            result: None,
        });
        assert!(matches!(
            grant.decode(reverted),
            Err(DeployError::Rejected { .. })
        ));
    }

    #[test]
    fn test_keyed_call_records_return_value() {
        let step = Step::call("${Timelock}", "createPair", 2_900_000)
            .with_args(vec![
                Arg::Address("${Multisig}".into()),
                Arg::Address("0x02".into()),
            ])
            .recording("Pair PNG/WHBAR (Contract)");

        assert!(!step.is_action());
        assert_eq!(
            step.record_key(&Checkpoint::new()).unwrap(),
            RecordKey::Result("Pair PNG/WHBAR (Contract)".into())
        );

        let receipt = OperationOutput::Receipt(Receipt {
            status: ReceiptStatus::Success,
            result: Some(serde_json::json!("0x0a")),
        });
        assert_eq!(step.decode(receipt).unwrap(), StepResult::from("0x0a"));
        assert!(matches!(
            step.decode(OperationOutput::Receipt(Receipt::success())),
            Err(DeployError::UnexpectedOutput { .. })
        ));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = Plan::from_yaml(TEST_PLAN_YAML).unwrap();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);

        b.steps.pop();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
