//! The central piece: applies a cycle's change set against HAProxy inside a
//! single transaction, including slot materialization, AZ weighting, and
//! the never-delete quiesce rule (§4.5).

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_types::{slot_server_name, BackendState, Service, ServiceInstance, ServiceKey};
use tracing::{info, warn};

use crate::change_detector::{self, ChangeDetector, ServiceChange};
use crate::config::FleetSyncConfig;
use crate::dataplane::{backend_payload, DataplaneClient, Server, ServerPayload};
use crate::error::{DataplaneError, FleetSyncError};
use crate::slot_allocator;
use crate::transaction::{run_in_transaction, TransactionHandle};

/// Retries after the first attempt on a version conflict: the first attempt
/// plus this many retries gives 4 total transactions for three successive
/// 409s followed by a success (§8 E6).
const MAX_VERSION_CONFLICT_RETRIES: u32 = 3;

pub struct Reconciler<C: DataplaneClient + ?Sized> {
    dataplane: Arc<C>,
    config: Arc<FleetSyncConfig>,
}

impl<C: DataplaneClient + ?Sized> Reconciler<C> {
    pub fn new(dataplane: Arc<C>, config: Arc<FleetSyncConfig>) -> Self {
        Self { dataplane, config }
    }

    /// Runs one reconciliation cycle for the discovered `services` against
    /// `detector`'s prior snapshot. Reuses `services` across version-conflict
    /// retries; discovery is never repeated within a cycle.
    pub async fn reconcile(&self, services: &[Service], detector: &mut ChangeDetector) -> Result<(), FleetSyncError> {
        let changes = detector.detect(services, &self.config.tags.az_weight_tag);
        if changes.is_empty() {
            return Ok(());
        }

        let mut retries = 0u32;
        loop {
            match self.attempt_cycle(&changes, detector).await {
                Ok(updates) => {
                    detector.commit(updates);
                    return Ok(());
                }
                Err(DataplaneError::VersionConflict) if retries < MAX_VERSION_CONFLICT_RETRIES => {
                    retries += 1;
                    warn!(retries, "dataplane version conflict, retrying cycle");
                    continue;
                }
                Err(err) => {
                    warn!(retries, error = %err, "reconcile cycle failed");
                    return Err(FleetSyncError::Dataplane(err));
                }
            }
        }
    }

    async fn attempt_cycle(
        &self,
        changes: &[ServiceChange],
        detector: &ChangeDetector,
    ) -> Result<BTreeMap<ServiceKey, BackendState>, DataplaneError> {
        let config = &self.config;
        run_in_transaction(self.dataplane.as_ref(), |handle| async move {
            let mut updates = BTreeMap::new();
            for change in changes {
                match change {
                    ServiceChange::Created(service) | ServiceChange::Changed(service) => {
                        let state = self.reconcile_service(service, &handle).await?;
                        updates.insert(service.key(), state);
                    }
                    ServiceChange::Removed(key) => {
                        let prior_slots = detector.prior_slot_count(key).max(config.haproxy.server_slots.base);
                        let state = self.quiesce_backend(key, prior_slots, &handle).await?;
                        updates.insert(key.clone(), state);
                    }
                }
            }
            Ok(updates)
        })
        .await
    }

    fn backend_name(&self, key: &ServiceKey) -> String {
        fleet_types::backend_name(key, &self.config.backend_name_prefix(), &self.config.haproxy.backend.name_separator)
    }

    async fn reconcile_service(&self, service: &Service, handle: &TransactionHandle) -> Result<BackendState, DataplaneError> {
        let key = service.key();
        let name = self.backend_name(&key);
        self.ensure_backend(&name, &key, handle).await?;
        let slot_count = self.materialize_slots(&name, &service.instances, handle).await?;

        let fingerprints = change_detector::fingerprint(service, &self.config.tags.az_weight_tag);
        Ok(BackendState::from_fingerprints(fingerprints.into_values().collect(), slot_count))
    }

    async fn quiesce_backend(&self, key: &ServiceKey, prior_slots: u32, handle: &TransactionHandle) -> Result<BackendState, DataplaneError> {
        let name = self.backend_name(key);
        self.ensure_backend(&name, key, handle).await?;
        let slot_count = self.materialize_slots_up_to(&name, &[], prior_slots, handle).await?;
        Ok(BackendState::quiesced(slot_count))
    }

    async fn ensure_backend(&self, name: &str, key: &ServiceKey, handle: &TransactionHandle) -> Result<(), DataplaneError> {
        if self.dataplane.get_backend(name, &handle.id).await?.is_some() {
            return Ok(());
        }
        let extra = self.config.haproxy.backend_options.get(&key.name);
        let payload = backend_payload(name, &self.config.haproxy.backend.mode, &self.config.haproxy.backend.balance, extra);
        self.dataplane.create_backend(payload, &handle.id).await?;
        handle.mark_changed();
        info!(backend = name, "created backend");
        Ok(())
    }

    async fn materialize_slots(&self, backend: &str, instances: &[ServiceInstance], handle: &TransactionHandle) -> Result<u32, DataplaneError> {
        let desired = slot_allocator::desired_slots(instances.len() as u32, &self.config.haproxy.server_slots);
        self.materialize_slots_up_to(backend, instances, desired, handle).await
    }

    /// Shared by the active and quiesced paths: reads the backend's current
    /// server list, computes `target = max(desired, currentServers.len())`,
    /// and issues create/replace writes for every slot that differs.
    async fn materialize_slots_up_to(
        &self,
        backend: &str,
        instances: &[ServiceInstance],
        desired: u32,
        handle: &TransactionHandle,
    ) -> Result<u32, DataplaneError> {
        let current_servers = self.dataplane.get_servers(backend, &handle.id).await?;
        let target = desired.max(current_servers.len() as u32);
        let existing: BTreeMap<String, Server> = current_servers.into_iter().map(|s| (s.name.clone(), s)).collect();

        for i in 0..target {
            let name = slot_server_name(i);
            let payload = if (i as usize) < instances.len() {
                self.active_payload(&name, &instances[i as usize])
            } else {
                parked_payload(&name)
            };

            match existing.get(&name) {
                Some(current) if matches(current, &payload) => {}
                Some(_) => {
                    self.dataplane.replace_server(backend, &name, &payload, &handle.id).await?;
                    handle.mark_changed();
                }
                None => {
                    self.dataplane.create_server(backend, &payload, &handle.id).await?;
                    handle.mark_changed();
                }
            }
        }

        Ok(target)
    }

    fn active_payload(&self, name: &str, service_instance: &ServiceInstance) -> ServerPayload {
        let (weight, backup) = self.az_options(service_instance);
        ServerPayload {
            name: name.to_string(),
            address: service_instance.instance.ip.clone(),
            port: service_instance.effective_port,
            maintenance: "disabled",
            check: "enabled",
            weight,
            backup: if backup { Some(true) } else { None },
            cookie: Some(name.to_string()),
        }
    }

    /// AZ weighting table (§4.5). Returns `(weight, backup)`; both absent
    /// when `availability_zone` is unset or the instance is in the same zone
    /// with no AZperc tag.
    fn az_options(&self, service_instance: &ServiceInstance) -> (Option<u8>, bool) {
        let ha_zone = match &self.config.haproxy.availability_zone {
            Some(zone) => zone,
            None => return (None, false),
        };
        let az_perc = service_instance
            .instance
            .tag(&self.config.tags.az_weight_tag)
            .and_then(change_detector::parse_az_perc);
        let same_az = service_instance.instance.zone.as_deref().map_or(true, |z| z == ha_zone);

        match (az_perc, same_az) {
            (None, true) => (None, false),
            (None, false) => (None, true),
            (Some(p), true) => (Some(100 - p), false),
            (Some(p), false) => (Some(p), false),
        }
    }
}

fn parked_payload(name: &str) -> ServerPayload {
    ServerPayload {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port: 80,
        maintenance: "enabled",
        check: "disabled",
        weight: None,
        backup: None,
        cookie: None,
    }
}

fn matches(current: &Server, desired: &ServerPayload) -> bool {
    current.address == desired.address
        && current.port == desired.port
        && current.maintenance.as_deref() == Some(desired.maintenance)
        && current.check.as_deref() == Some(desired.check)
        && current.weight == desired.weight
        && current.backup.unwrap_or(false) == desired.backup.unwrap_or(false)
        && current.cookie == desired.cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::Instance;
    use std::collections::BTreeMap as Map;

    fn instance(id: &str, ip: &str, zone: Option<&str>, az_perc: Option<&str>) -> ServiceInstance {
        let mut tags = Map::new();
        if let Some(p) = az_perc {
            tags.insert("HAProxy:Instance:AZperc".to_string(), p.to_string());
        }
        ServiceInstance {
            instance: Instance { id: id.into(), ip: ip.into(), region: "eastus".into(), zone: zone.map(String::from), tags },
            effective_port: 8080,
        }
    }

    fn config_with_az(zone: Option<&str>) -> FleetSyncConfig {
        use crate::config::*;
        FleetSyncConfig {
            provider: ProviderConfig::Azure { subscription_id: "s".into(), resource_group: "rg".into(), vmss_names: vec![] },
            haproxy: HaProxyConfig {
                base_url: "https://example.com".into(),
                api_version: "v2".into(),
                username: "u".into(),
                password: "p".into(),
                timeout_seconds: 10,
                verify_ssl: true,
                availability_zone: zone.map(String::from),
                backend: BackendConfig::default(),
                server_slots: ServerSlotsConfig::default(),
                backend_options: Map::new(),
            },
            tags: TagsConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    struct NullClient;
    #[async_trait::async_trait]
    impl DataplaneClient for NullClient {
        async fn get_configuration_version(&self) -> Result<i64, DataplaneError> { Ok(1) }
        async fn create_transaction(&self, _v: i64) -> Result<String, DataplaneError> { Ok("t".into()) }
        async fn commit_transaction(&self, _id: &str) -> Result<(), DataplaneError> { Ok(()) }
        async fn delete_transaction(&self, _id: &str) -> Result<(), DataplaneError> { Ok(()) }
        async fn get_backend(&self, _n: &str, _t: &str) -> Result<Option<crate::dataplane::Backend>, DataplaneError> { Ok(None) }
        async fn create_backend(&self, _p: serde_json::Value, _t: &str) -> Result<(), DataplaneError> { Ok(()) }
        async fn get_servers(&self, _b: &str, _t: &str) -> Result<Vec<Server>, DataplaneError> { Ok(vec![]) }
        async fn create_server(&self, _b: &str, _p: &ServerPayload, _t: &str) -> Result<(), DataplaneError> { Ok(()) }
        async fn replace_server(&self, _b: &str, _n: &str, _p: &ServerPayload, _t: &str) -> Result<(), DataplaneError> { Ok(()) }
        async fn delete_server(&self, _b: &str, _n: &str, _t: &str) -> Result<(), DataplaneError> { Ok(()) }
    }

    fn reconciler(zone: Option<&str>) -> Reconciler<NullClient> {
        Reconciler::new(Arc::new(NullClient), Arc::new(config_with_az(zone)))
    }

    #[test]
    fn az_unset_yields_default_weight() {
        let r = reconciler(None);
        let si = instance("i1", "10.0.0.1", Some("us-east-1a"), None);
        assert_eq!(r.az_options(&si), (None, false));
    }

    #[test]
    fn same_az_no_perc_is_default_weight() {
        let r = reconciler(Some("us-east-1a"));
        let si = instance("i1", "10.0.0.1", Some("us-east-1a"), None);
        assert_eq!(r.az_options(&si), (None, false));
    }

    #[test]
    fn different_az_no_perc_is_backup() {
        let r = reconciler(Some("us-east-1a"));
        let si = instance("i2", "10.0.0.2", Some("us-east-1b"), None);
        assert_eq!(r.az_options(&si), (None, true));
    }

    #[test]
    fn same_az_with_perc_inverts_weight() {
        let r = reconciler(Some("us-east-1a"));
        let si = instance("i1", "10.0.0.1", Some("us-east-1a"), Some("20"));
        assert_eq!(r.az_options(&si), (Some(80), false));
    }

    #[test]
    fn different_az_with_perc_uses_perc_as_weight_not_backup() {
        let r = reconciler(Some("us-east-1a"));
        let si = instance("i2", "10.0.0.2", Some("us-east-1b"), Some("20"));
        assert_eq!(r.az_options(&si), (Some(20), false));
    }

    #[test]
    fn missing_zone_is_treated_as_same_az() {
        let r = reconciler(Some("us-east-1a"));
        let si = instance("i1", "10.0.0.1", None, None);
        assert_eq!(r.az_options(&si), (None, false));
    }

    #[test]
    fn az_perc_boundary_values_are_absent() {
        let r = reconciler(Some("us-east-1a"));
        let zero = instance("i1", "10.0.0.1", Some("us-east-1b"), Some("0"));
        let hundred = instance("i2", "10.0.0.2", Some("us-east-1b"), Some("100"));
        assert_eq!(r.az_options(&zero), (None, true));
        assert_eq!(r.az_options(&hundred), (None, true));
    }

    /// Fails `commit_transaction` with a version conflict a fixed number of
    /// times before succeeding, recording every transaction id it hands out,
    /// commits, and deletes.
    #[derive(Default)]
    struct FlakyClient {
        conflicts_remaining: std::sync::atomic::AtomicU32,
        created: std::sync::Mutex<Vec<String>>,
        committed: std::sync::Mutex<Vec<String>>,
        deleted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DataplaneClient for FlakyClient {
        async fn get_configuration_version(&self) -> Result<i64, DataplaneError> {
            Ok(1)
        }
        async fn create_transaction(&self, _v: i64) -> Result<String, DataplaneError> {
            let mut created = self.created.lock().unwrap();
            let id = format!("txn-{}", created.len() + 1);
            created.push(id.clone());
            Ok(id)
        }
        async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError> {
            let remaining = self.conflicts_remaining.load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts_remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(DataplaneError::VersionConflict);
            }
            self.committed.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn get_backend(&self, _n: &str, _t: &str) -> Result<Option<crate::dataplane::Backend>, DataplaneError> {
            Ok(None)
        }
        async fn create_backend(&self, _p: serde_json::Value, _t: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn get_servers(&self, _b: &str, _t: &str) -> Result<Vec<Server>, DataplaneError> {
            Ok(vec![])
        }
        async fn create_server(&self, _b: &str, _p: &ServerPayload, _t: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn replace_server(&self, _b: &str, _n: &str, _p: &ServerPayload, _t: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
        async fn delete_server(&self, _b: &str, _n: &str, _t: &str) -> Result<(), DataplaneError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn three_successive_conflicts_then_success_commits_on_the_fourth_attempt() {
        let client = Arc::new(FlakyClient {
            conflicts_remaining: std::sync::atomic::AtomicU32::new(3),
            ..Default::default()
        });
        let reconciler = Reconciler::new(client.clone(), Arc::new(config_with_az(None)));
        let mut detector = ChangeDetector::new();
        let service = Service { name: "web".into(), port: 8080, region: "eastus".into(), instances: vec![] };

        let result = reconciler.reconcile(&[service.clone()], &mut detector).await;

        assert!(result.is_ok());
        assert_eq!(client.created.lock().unwrap().len(), 4);
        assert_eq!(client.committed.lock().unwrap().len(), 1);
        assert_eq!(client.deleted.lock().unwrap().len(), 3);

        // The successful attempt's state is what ends up in the snapshot.
        assert!(detector.detect(&[service], &config_with_az(None).tags.az_weight_tag).is_empty());
    }
}
