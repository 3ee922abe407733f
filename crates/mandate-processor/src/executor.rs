//! The pluggable business action.

use async_trait::async_trait;
use parking_lot::Mutex;

use mandate_auth::Claims;
use mandate_types::Result;

use crate::Transaction;

/// Executes the business action behind an authorized transaction.
///
/// Runs only after token validation, restriction evaluation, and the
/// composite guard have all admitted the request. Returns a short
/// disposition string recorded with the processed transaction.
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// Perform the action.
    async fn execute(&self, tx: &Transaction, claims: &Claims) -> Result<String>;
}

/// Executor that records what it ran and reports `executed`.
///
/// Good enough for demos and the reference tests; real deployments plug
/// their ledger or payment rail in here.
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of transactions executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// How many transactions have been executed.
    pub fn count(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl TransactionExecutor for RecordingExecutor {
    async fn execute(&self, tx: &Transaction, _claims: &Claims) -> Result<String> {
        self.executed.lock().push(tx.id.clone());
        Ok("executed".to_string())
    }
}
