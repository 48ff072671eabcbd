//! Chain client backed by an external helper command.
//!
//! The helper wraps the actual ledger SDK (signing, fees, receipts). For
//! every operation it is spawned once, receives the operation as JSON on
//! stdin and prints an [`OperationOutput`] as JSON on stdout.
//!
//! The operator balance is requested as `{"kind":"balance"}` and answered
//! with a `value` holding the balance in tinybar (a number or a decimal
//! string).
//!
//! Exit status contract:
//! - `0`: success, stdout holds the output
//! - `75` (`EX_TEMPFAIL`): transient failure, safe to retry
//! - anything else: the ledger rejected the operation

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{
    AccountCreate, ChainClient, ContractCall, ContractCreate, ContractQuery, Created, Operation,
    OperationOutput, Receipt,
};
use crate::error::ChainError;

/// Exit status a helper uses to signal a retryable failure
pub const EXIT_TRANSIENT: i32 = 75;

/// Chain client that shells out to a helper program
#[derive(Debug, Clone)]
pub struct CommandClient {
    program: String,
    args: Vec<String>,
    call_timeout: Duration,
}

impl CommandClient {
    pub fn new(program: impl Into<String>, args: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            call_timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, op: &Operation) -> Result<OperationOutput, ChainError> {
        let payload = serde_json::to_vec(op)
            .map_err(|e| ChainError::Client(format!("failed to encode operation: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChainError::Client(format!("failed to spawn '{}': {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ChainError::Unavailable(format!("failed to write to helper: {e}")))?;
            // Drop stdin to signal EOF
        }

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| ChainError::Timeout {
                operation: op.label().to_string(),
                seconds: self.call_timeout.as_secs(),
            })?
            .map_err(|e| ChainError::Unavailable(format!("failed to wait for helper: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TRANSIENT) => {
                return Err(ChainError::Unavailable(stderr.trim().to_string()));
            }
            Some(code) => {
                return Err(ChainError::Rejected(format!(
                    "helper exited with {}: {}",
                    code,
                    stderr.trim()
                )));
            }
            None => {
                return Err(ChainError::Unavailable(format!(
                    "helper terminated by signal: {}",
                    stderr.trim()
                )));
            }
        }

        debug!(operation = op.label(), bytes = output.stdout.len(), "Helper returned");

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ChainError::Client(format!("unparseable helper output: {e}")))
    }

    fn unexpected(op: &Operation, output: &OperationOutput) -> ChainError {
        ChainError::Client(format!(
            "helper returned {:?} for '{}'",
            output,
            op.label()
        ))
    }
}

#[async_trait]
impl ChainClient for CommandClient {
    fn name(&self) -> &str {
        "command"
    }

    async fn create_contract(&self, op: &ContractCreate) -> Result<Created, ChainError> {
        let op = Operation::CreateContract(op.clone());
        match self.invoke(&op).await? {
            OperationOutput::Created(created) => Ok(created),
            other => Err(Self::unexpected(&op, &other)),
        }
    }

    async fn create_account(&self, op: &AccountCreate) -> Result<Created, ChainError> {
        let op = Operation::CreateAccount(op.clone());
        match self.invoke(&op).await? {
            OperationOutput::Created(created) => Ok(created),
            other => Err(Self::unexpected(&op, &other)),
        }
    }

    async fn call_function(&self, op: &ContractCall) -> Result<Receipt, ChainError> {
        let op = Operation::Call(op.clone());
        match self.invoke(&op).await? {
            OperationOutput::Receipt(receipt) => Ok(receipt),
            other => Err(Self::unexpected(&op, &other)),
        }
    }

    async fn query_function(&self, op: &ContractQuery) -> Result<serde_json::Value, ChainError> {
        let op = Operation::Query(op.clone());
        match self.invoke(&op).await? {
            OperationOutput::Value { value } => Ok(value),
            other => Err(Self::unexpected(&op, &other)),
        }
    }

    async fn balance(&self) -> Result<Option<u64>, ChainError> {
        let op = Operation::Balance;
        match self.invoke(&op).await? {
            OperationOutput::Value { value } => match &value {
                serde_json::Value::Null => Ok(None),
                serde_json::Value::Number(n) => n
                    .as_u64()
                    .map(Some)
                    .ok_or_else(|| ChainError::Client(format!("invalid balance {}", n))),
                serde_json::Value::String(s) => s
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ChainError::Client(format!("invalid balance '{}'", s))),
                _ => Err(ChainError::Client(format!("invalid balance {}", value))),
            },
            other => Err(Self::unexpected(&op, &other)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorClass};

    fn shell(script: &str) -> CommandClient {
        CommandClient::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    fn query() -> ContractQuery {
        ContractQuery {
            contract: "0.0.1001".into(),
            function: "TOKEN_ID".into(),
            args: vec![],
            gas: 24_000,
        }
    }

    #[tokio::test]
    async fn test_successful_query() {
        let client = shell(r#"cat > /dev/null; echo '{"kind":"value","value":"0xabc"}'"#);
        let value = client.query_function(&query()).await.unwrap();
        assert_eq!(value, serde_json::json!("0xabc"));
    }

    #[tokio::test]
    async fn test_balance_query() {
        let client = shell(
            r#"grep -q '"kind":"balance"' && echo '{"kind":"value","value":"250000000"}'"#,
        );
        assert_eq!(client.balance().await.unwrap(), Some(250_000_000));

        let unknown = shell(r#"cat > /dev/null; echo '{"kind":"value","value":null}'"#);
        assert_eq!(unknown.balance().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tempfail_is_transient() {
        let client = shell("cat > /dev/null; echo busy >&2; exit 75");
        let err = client.query_function(&query()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_other_exit_is_rejection() {
        let client = shell("cat > /dev/null; echo INSUFFICIENT_GAS >&2; exit 1");
        let err = client.query_function(&query()).await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected(ref msg) if msg.contains("INSUFFICIENT_GAS")));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let client = CommandClient::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        let err = client.query_function(&query()).await.unwrap_err();
        assert!(matches!(err, ChainError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let client = CommandClient::new(
            "/nonexistent/ledger-helper",
            vec![],
            Duration::from_secs(1),
        );
        let err = client.query_function(&query()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
