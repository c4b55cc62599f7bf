//! `DataplaneClient`: the trait consumed by the reconciler, plus a
//! reqwest-backed implementation against HAProxy's Dataplane REST API (§6.2).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::HaProxyConfig;
use crate::error::DataplaneError;

#[derive(Debug, Clone, Deserialize)]
pub struct Backend {
    pub name: String,
}

/// Server record as materialized by the reconciler. `maintenance`/`check`
/// mirror the Dataplane API's `"enabled"`/`"disabled"` string enums rather
/// than booleans.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerPayload {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub maintenance: &'static str,
    pub check: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

/// Server record as returned by the Dataplane API, used only to compare
/// against the desired `ServerPayload` set.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub maintenance: Option<String>,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub weight: Option<u8>,
    #[serde(default)]
    pub backup: Option<bool>,
    #[serde(default)]
    pub cookie: Option<String>,
}

/// The full set of operations the reconciler needs against HAProxy's
/// configuration store. All calls are scoped to a transaction id except
/// version/transaction lifecycle calls themselves.
#[async_trait]
pub trait DataplaneClient: Send + Sync {
    async fn get_configuration_version(&self) -> Result<i64, DataplaneError>;
    async fn create_transaction(&self, version: i64) -> Result<String, DataplaneError>;
    async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError>;
    async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError>;
    async fn get_backend(&self, name: &str, txn: &str) -> Result<Option<Backend>, DataplaneError>;
    async fn create_backend(&self, payload: Value, txn: &str) -> Result<(), DataplaneError>;
    async fn get_servers(&self, backend: &str, txn: &str) -> Result<Vec<Server>, DataplaneError>;
    async fn create_server(&self, backend: &str, payload: &ServerPayload, txn: &str) -> Result<(), DataplaneError>;
    async fn replace_server(
        &self,
        backend: &str,
        name: &str,
        payload: &ServerPayload,
        txn: &str,
    ) -> Result<(), DataplaneError>;
    async fn delete_server(&self, backend: &str, name: &str, txn: &str) -> Result<(), DataplaneError>;
}

/// Build the backend-create JSON payload: fixed fields plus any
/// service-specific `backend_options` fragment merged verbatim.
pub fn backend_payload(name: &str, mode: &str, balance: &str, extra: Option<&Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::String(name.to_string()));
    obj.insert("mode".into(), Value::String(mode.to_string()));
    obj.insert(
        "balance".into(),
        serde_json::json!({ "algorithm": balance }),
    );
    if let Some(Value::Object(extra)) = extra {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Value::Object(obj)
}

/// reqwest-based implementation. Builds every URL under
/// `base_url/{api_version}/...`, attaches HTTP Basic auth, and maps
/// non-2xx responses to `DataplaneError` (409 -> `VersionConflict`).
pub struct HttpDataplaneClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    username: String,
    password: String,
}

impl HttpDataplaneClient {
    pub fn new(config: &HaProxyConfig) -> Result<Self, DataplaneError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, self.api_version, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DataplaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 409 {
            return Err(DataplaneError::VersionConflict);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DataplaneError::Api { status: status.as_u16(), body })
    }
}

#[async_trait]
impl DataplaneClient for HttpDataplaneClient {
    async fn get_configuration_version(&self) -> Result<i64, DataplaneError> {
        #[derive(Deserialize)]
        struct VersionResponse {
            version: i64,
        }
        let response = self
            .client
            .get(self.url("/services/haproxy/configuration/version"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json::<VersionResponse>().await?.version)
    }

    async fn create_transaction(&self, version: i64) -> Result<String, DataplaneError> {
        #[derive(Deserialize)]
        struct TransactionResponse {
            id: String,
        }
        let response = self
            .client
            .post(self.url("/services/haproxy/transactions"))
            .query(&[("version", version)])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json::<TransactionResponse>().await?.id)
    }

    async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let response = self
            .client
            .put(self.url(&format!("/services/haproxy/transactions/{id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let response = self
            .client
            .delete(self.url(&format!("/services/haproxy/transactions/{id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        match Self::check_status(response).await {
            Ok(_) => Ok(()),
            // Deleting an already-gone transaction is not an error: idempotent by contract.
            Err(DataplaneError::Api { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get_backend(&self, name: &str, txn: &str) -> Result<Option<Backend>, DataplaneError> {
        let response = self
            .client
            .get(self.url(&format!("/services/haproxy/configuration/backends/{name}")))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        Ok(Some(response.json::<Backend>().await?))
    }

    async fn create_backend(&self, payload: Value, txn: &str) -> Result<(), DataplaneError> {
        let response = self
            .client
            .post(self.url("/services/haproxy/configuration/backends"))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn get_servers(&self, backend: &str, txn: &str) -> Result<Vec<Server>, DataplaneError> {
        let response = self
            .client
            .get(self.url(&format!("/services/haproxy/configuration/backends/{backend}/servers")))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json::<Vec<Server>>().await?)
    }

    async fn create_server(&self, backend: &str, payload: &ServerPayload, txn: &str) -> Result<(), DataplaneError> {
        debug!(backend, server = %payload.name, "create_server");
        let response = self
            .client
            .post(self.url(&format!("/services/haproxy/configuration/backends/{backend}/servers")))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn replace_server(
        &self,
        backend: &str,
        name: &str,
        payload: &ServerPayload,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        debug!(backend, server = name, "replace_server");
        let response = self
            .client
            .put(self.url(&format!("/services/haproxy/configuration/backends/{backend}/servers/{name}")))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_server(&self, backend: &str, name: &str, txn: &str) -> Result<(), DataplaneError> {
        let response = self
            .client
            .delete(self.url(&format!("/services/haproxy/configuration/backends/{backend}/servers/{name}")))
            .query(&[("transaction_id", txn)])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}
