//! Scoped acquisition of a Dataplane transaction with guaranteed release on
//! every exit path (§4.6).
//!
//! Rust has no async `Drop`, so the guarantee is implemented as a scope
//! function rather than a literal RAII guard: `run_in_transaction` owns the
//! transaction's entire lifetime and releases it on every return path of its
//! body closure, including early returns via `?`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dataplane::DataplaneClient;
use crate::error::DataplaneError;

/// Handle passed into a transaction scope's body. `mark_changed` is the only
/// mutation the body may perform on the scope itself.
pub struct TransactionHandle {
    pub id: String,
    changed: Arc<AtomicBool>,
}

impl TransactionHandle {
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }
}

/// Run `body` inside a fresh transaction against the latest configuration
/// version.
///
/// - Body succeeds and `mark_changed()` was called: commit.
/// - Body succeeds and nothing changed: delete (discard) — commit must never
///   be issued for an empty transaction.
/// - Body fails for any reason: delete (abort); the error propagates to the
///   caller, which decides whether to retry (version conflict) or surface it.
pub async fn run_in_transaction<C, F, Fut, T>(client: &C, body: F) -> Result<T, DataplaneError>
where
    C: DataplaneClient + ?Sized,
    F: FnOnce(TransactionHandle) -> Fut,
    Fut: Future<Output = Result<T, DataplaneError>>,
{
    let version = client.get_configuration_version().await?;
    let id = client.create_transaction(version).await?;
    let changed = Arc::new(AtomicBool::new(false));
    let handle = TransactionHandle { id: id.clone(), changed: changed.clone() };

    match body(handle).await {
        Ok(value) => {
            if changed.load(Ordering::SeqCst) {
                match client.commit_transaction(&id).await {
                    Ok(()) => Ok(value),
                    Err(err) => {
                        let _ = client.delete_transaction(&id).await;
                        Err(err)
                    }
                }
            } else {
                client.delete_transaction(&id).await?;
                Ok(value)
            }
        }
        Err(err) => {
            let _ = client.delete_transaction(&id).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{Backend, Server, ServerPayload};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        committed: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        next_version: Mutex<i64>,
        next_txn: Mutex<u32>,
    }

    #[async_trait]
    impl DataplaneClient for RecordingClient {
        async fn get_configuration_version(&self) -> Result<i64, DataplaneError> {
            Ok(*self.next_version.lock().unwrap())
        }
        async fn create_transaction(&self, _version: i64) -> Result<String, DataplaneError> {
            let mut n = self.next_txn.lock().unwrap();
            *n += 1;
            Ok(format!("txn-{n}"))
        }
        async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError> {
            self.committed.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn get_backend(&self, _name: &str, _txn: &str) -> Result<Option<Backend>, DataplaneError> {
            Ok(None)
        }
        async fn create_backend(&self, _payload: serde_json::Value, _txn: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn get_servers(&self, _backend: &str, _txn: &str) -> Result<Vec<Server>, DataplaneError> {
            Ok(vec![])
        }
        async fn create_server(&self, _backend: &str, _payload: &ServerPayload, _txn: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn replace_server(
            &self,
            _backend: &str,
            _name: &str,
            _payload: &ServerPayload,
            _txn: &str,
        ) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn delete_server(&self, _backend: &str, _name: &str, _txn: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unchanged_scope_discards_without_commit() {
        let client = RecordingClient::default();
        run_in_transaction(&client, |handle| async move {
            let _ = &handle;
            Ok::<_, DataplaneError>(())
        })
        .await
        .unwrap();

        assert!(client.committed.lock().unwrap().is_empty());
        assert_eq!(client.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_scope_commits() {
        let client = RecordingClient::default();
        run_in_transaction(&client, |handle| async move {
            handle.mark_changed();
            Ok::<_, DataplaneError>(())
        })
        .await
        .unwrap();

        assert_eq!(client.committed.lock().unwrap().len(), 1);
        assert!(client.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_body_aborts() {
        let client = RecordingClient::default();
        let result = run_in_transaction(&client, |handle| async move {
            handle.mark_changed();
            Err::<(), _>(DataplaneError::Api { status: 500, body: "boom".into() })
        })
        .await;

        assert!(result.is_err());
        assert!(client.committed.lock().unwrap().is_empty());
        assert_eq!(client.deleted.lock().unwrap().len(), 1);
    }
}
