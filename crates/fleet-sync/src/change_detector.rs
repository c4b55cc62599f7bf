//! Diffs the current service map against the prior cycle's snapshot (§4.3).
//!
//! The detector is the only place cross-cycle state lives besides the
//! daemon loop's failure counter and SIGHUP flag. It holds no I/O handles
//! and performs no commits itself — the reconciler commits the new snapshot
//! after a successful write.

use std::collections::BTreeMap;

use fleet_types::{BackendState, InstanceFingerprint, Service, ServiceKey};

/// What happened to one service between the prior snapshot and this cycle.
#[derive(Debug, Clone)]
pub enum ServiceChange {
    Created(Service),
    Changed(Service),
    /// Present in the prior snapshot, absent this cycle: quiesce, keep slots.
    Removed(ServiceKey),
}

/// Parses an AZperc tag value. Values outside 1..=99, or unparseable, are
/// treated as absent — shared by the change detector's fingerprinting and
/// the reconciler's AZ-weighting pass so both agree on what "changed" means.
pub fn parse_az_perc(raw: &str) -> Option<u8> {
    raw.parse::<u32>().ok().filter(|v| (1..=99).contains(v)).map(|v| v as u8)
}

/// Builds the (instance_id, ip, port, zone, az_perc) quintuple set for a
/// service. Shared by change detection and by the reconciler, which stores
/// the same shape back into the snapshot after a successful commit.
pub(crate) fn fingerprint(service: &Service, az_weight_tag: &str) -> BTreeMap<String, InstanceFingerprint> {
    service
        .instances
        .iter()
        .map(|si| {
            let az_perc = si.instance.tag(az_weight_tag).and_then(parse_az_perc);
            (
                si.instance.id.clone(),
                InstanceFingerprint {
                    instance_id: si.instance.id.clone(),
                    ip: si.instance.ip.clone(),
                    port: si.effective_port,
                    zone: si.instance.zone.clone(),
                    az_perc,
                },
            )
        })
        .collect()
}

/// Holds the prior cycle's per-service state. Empty on process start and
/// after a SIGHUP.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    snapshot: BTreeMap<ServiceKey, BackendState>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self { snapshot: BTreeMap::new() }
    }

    /// Clear the snapshot; the next `detect` treats every discovered service
    /// as Created.
    pub fn clear(&mut self) {
        self.snapshot.clear();
    }

    /// Classify `current` against the prior snapshot. Does not mutate the
    /// snapshot — call `commit` after a successful reconcile.
    pub fn detect(&self, current: &[Service], az_weight_tag: &str) -> Vec<ServiceChange> {
        let mut changes = Vec::new();
        let mut seen = std::collections::BTreeSet::new();

        for service in current {
            let key = service.key();
            seen.insert(key.clone());
            match self.snapshot.get(&key) {
                None => changes.push(ServiceChange::Created(service.clone())),
                Some(prior) => {
                    let current_fp = fingerprint(service, az_weight_tag);
                    if current_fp != prior.instances {
                        changes.push(ServiceChange::Changed(service.clone()));
                    }
                }
            }
        }

        for key in self.snapshot.keys() {
            if !seen.contains(key) && !self.is_quiesced(key) {
                changes.push(ServiceChange::Removed(key.clone()));
            }
        }

        changes
    }

    fn is_quiesced(&self, key: &ServiceKey) -> bool {
        self.snapshot.get(key).map(|s| s.instances.is_empty()).unwrap_or(false)
    }

    /// Merge per-service state for every service touched this cycle into the
    /// snapshot, including quiesced (removed) services in their parked form
    /// so slot counts are retained. Services not touched this cycle (the
    /// Unchanged case) keep their existing snapshot entry untouched.
    pub fn commit(&mut self, updates: BTreeMap<ServiceKey, BackendState>) {
        self.snapshot.extend(updates);
    }

    pub fn prior_slot_count(&self, key: &ServiceKey) -> u32 {
        self.snapshot.get(key).map(|s| s.slot_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{Instance, ServiceInstance};
    use std::collections::BTreeMap as Map;

    fn service(name: &str, ip: &str) -> Service {
        Service {
            name: name.into(),
            port: 8080,
            region: "eastus".into(),
            instances: vec![ServiceInstance {
                instance: Instance { id: "i1".into(), ip: ip.into(), region: "eastus".into(), zone: None, tags: Map::new() },
                effective_port: 8080,
            }],
        }
    }

    #[test]
    fn new_service_is_created() {
        let detector = ChangeDetector::new();
        let changes = detector.detect(&[service("web", "10.0.0.1")], "HAProxy:Instance:AZperc");
        assert!(matches!(changes.as_slice(), [ServiceChange::Created(_)]));
    }

    #[test]
    fn unchanged_service_emits_nothing() {
        let mut detector = ChangeDetector::new();
        let svc = service("web", "10.0.0.1");
        let key = svc.key();
        let fp = fingerprint(&svc, "HAProxy:Instance:AZperc");
        let mut results = BTreeMap::new();
        results.insert(key, BackendState::from_fingerprints(fp.into_values().collect(), 10));
        detector.commit(results);

        let changes = detector.detect(&[svc], "HAProxy:Instance:AZperc");
        assert!(changes.is_empty());
    }

    #[test]
    fn changed_ip_is_detected() {
        let mut detector = ChangeDetector::new();
        let svc = service("web", "10.0.0.1");
        let key = svc.key();
        let fp = fingerprint(&svc, "HAProxy:Instance:AZperc");
        let mut results = BTreeMap::new();
        results.insert(key, BackendState::from_fingerprints(fp.into_values().collect(), 10));
        detector.commit(results);

        let changes = detector.detect(&[service("web", "10.0.0.2")], "HAProxy:Instance:AZperc");
        assert!(matches!(changes.as_slice(), [ServiceChange::Changed(_)]));
    }

    #[test]
    fn removed_service_emits_quiesce_once() {
        let mut detector = ChangeDetector::new();
        let svc = service("web", "10.0.0.1");
        let key = svc.key();
        let fp = fingerprint(&svc, "HAProxy:Instance:AZperc");
        let mut results = BTreeMap::new();
        results.insert(key.clone(), BackendState::from_fingerprints(fp.into_values().collect(), 10));
        detector.commit(results);

        let changes = detector.detect(&[], "HAProxy:Instance:AZperc");
        assert!(matches!(changes.as_slice(), [ServiceChange::Removed(k)] if *k == key));

        // After quiescing, a subsequent identical empty cycle emits nothing.
        let mut quiesced = BTreeMap::new();
        quiesced.insert(key, BackendState::quiesced(10));
        detector.commit(quiesced);
        let changes = detector.detect(&[], "HAProxy:Instance:AZperc");
        assert!(changes.is_empty());
    }
}
