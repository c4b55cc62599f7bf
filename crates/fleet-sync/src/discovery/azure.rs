//! Azure backend: enumerates VMSS instances and standalone VMs in a resource
//! group, resolving each NIC's private IP.
//!
//! Credentials are acquired via the OAuth2 client-credentials grant against
//! Azure AD directly over `reqwest` — this spec does not pin an Azure SDK
//! crate, only the trait contract and the shape of the returned `Instance`
//! records (§6.1).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fleet_types::Instance;
use serde::Deserialize;
use tracing::{debug, warn};

use super::DiscoveryClient;
use crate::error::DiscoveryError;

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const API_VERSION: &str = "2023-09-01";

pub struct AzureDiscoveryClient {
    client: reqwest::Client,
    subscription_id: String,
    resource_group: String,
    vmss_names: Vec<String>,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl AzureDiscoveryClient {
    pub fn new(subscription_id: String, resource_group: String, vmss_names: Vec<String>) -> Result<Self, DiscoveryError> {
        let tenant_id = std::env::var("AZURE_TENANT_ID")
            .map_err(|_| DiscoveryError::Credentials("AZURE_TENANT_ID is not set".into()))?;
        let client_id = std::env::var("AZURE_CLIENT_ID")
            .map_err(|_| DiscoveryError::Credentials("AZURE_CLIENT_ID is not set".into()))?;
        let client_secret = std::env::var("AZURE_CLIENT_SECRET")
            .map_err(|_| DiscoveryError::Credentials("AZURE_CLIENT_SECRET is not set".into()))?;
        let client = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, subscription_id, resource_group, vmss_names, tenant_id, client_id, client_secret })
    }

    async fn fetch_token(&self) -> Result<String, DiscoveryError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let url = format!("https://login.microsoftonline.com/{}/oauth2/v2.0/token", self.tenant_id);
        let response = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Credentials(format!(
                "token request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json::<TokenResponse>().await?.access_token)
    }

    async fn list_vmss_instances(&self, vmss_name: &str, token: &str) -> Result<Vec<ArmVm>, DiscoveryError> {
        let url = format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{vmss_name}/virtualMachines?api-version={API_VERSION}",
            self.subscription_id, self.resource_group,
        );
        self.get_arm_list(&url, token).await
    }

    async fn list_standalone_vms(&self, token: &str) -> Result<Vec<ArmVm>, DiscoveryError> {
        let url = format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines?api-version={API_VERSION}",
            self.subscription_id, self.resource_group,
        );
        self.get_arm_list(&url, token).await
    }

    async fn get_arm_list(&self, url: &str, token: &str) -> Result<Vec<ArmVm>, DiscoveryError> {
        let response = self.client.get(url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Api(format!("ARM request failed ({status}): {body}")));
        }
        Ok(response.json::<ArmListResponse<ArmVm>>().await?.value)
    }

    async fn resolve_nic_ip(&self, nic_id: &str, token: &str) -> Result<Option<String>, DiscoveryError> {
        let url = format!("{MANAGEMENT_ENDPOINT}{nic_id}?api-version={API_VERSION}");
        let response = self.client.get(url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            warn!(nic_id, status = %response.status(), "failed to resolve NIC, skipping instance");
            return Ok(None);
        }
        let nic = response.json::<ArmNic>().await?;
        Ok(nic
            .properties
            .ip_configurations
            .into_iter()
            .find_map(|cfg| cfg.properties.private_ip_address))
    }

    async fn to_instance(&self, vm: ArmVm, token: &str) -> Option<Instance> {
        let nic_ref = vm.properties.network_profile.network_interfaces.first()?;
        let ip = match self.resolve_nic_ip(&nic_ref.id, token).await {
            Ok(Some(ip)) => ip,
            Ok(None) => return None,
            Err(err) => {
                warn!(vm = %vm.name, error = %err, "skipping instance after NIC resolution error");
                return None;
            }
        };
        Some(Instance {
            id: vm.id,
            ip,
            region: vm.location,
            zone: vm.zones.into_iter().next(),
            tags: vm.tags,
        })
    }
}

#[async_trait]
impl DiscoveryClient for AzureDiscoveryClient {
    async fn discover_all(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let token = self.fetch_token().await?;
        let mut seen = BTreeMap::new();

        for vmss_name in &self.vmss_names {
            debug!(vmss_name, "listing VMSS instances");
            for vm in self.list_vmss_instances(vmss_name, &token).await? {
                if let Some(instance) = self.to_instance(vm, &token).await {
                    seen.entry(instance.id.clone()).or_insert(instance);
                }
            }
        }

        for vm in self.list_standalone_vms(&token).await? {
            if let Some(instance) = self.to_instance(vm, &token).await {
                seen.entry(instance.id.clone()).or_insert(instance);
            }
        }

        Ok(seen.into_values().collect())
    }
}

#[derive(Debug, Deserialize)]
struct ArmListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ArmVm {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    zones: Vec<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    properties: ArmVmProperties,
}

#[derive(Debug, Deserialize)]
struct ArmVmProperties {
    #[serde(rename = "networkProfile")]
    network_profile: ArmNetworkProfile,
}

#[derive(Debug, Deserialize)]
struct ArmNetworkProfile {
    #[serde(rename = "networkInterfaces")]
    network_interfaces: Vec<ArmNicRef>,
}

#[derive(Debug, Deserialize)]
struct ArmNicRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ArmNic {
    properties: ArmNicProperties,
}

#[derive(Debug, Deserialize)]
struct ArmNicProperties {
    #[serde(rename = "ipConfigurations")]
    ip_configurations: Vec<ArmIpConfig>,
}

#[derive(Debug, Deserialize)]
struct ArmIpConfig {
    properties: ArmIpConfigProperties,
}

#[derive(Debug, Deserialize)]
struct ArmIpConfigProperties {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
}
