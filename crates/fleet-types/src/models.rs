//! Core domain model for the reconciliation pipeline: instances, services,
//! and the per-backend state the change detector keeps between cycles.
//!
//! Every type here is a plain, immutable value type. Instances and services
//! are rebuilt from scratch each polling cycle; nothing in this module is
//! mutated in place.

use std::collections::BTreeMap;
use std::fmt;

/// One running cloud compute unit, as surfaced by a `DiscoveryClient`.
///
/// An `Instance` is immutable for its lifetime within a cycle: cycles
/// recreate instances rather than mutating them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider-unique identifier (EC2 instance id, Azure VM resource id, ...).
    pub id: String,
    /// The address HAProxy will dial.
    pub ip: String,
    /// Cloud region the instance lives in.
    pub region: String,
    /// Availability zone, if the provider reports one.
    pub zone: Option<String>,
    /// Tags as reported by the provider. Keys are unique.
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Identity key for a `Service`: the tuple reconciliation groups instances by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub port: u16,
    pub region: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.name, self.port, self.region)
    }
}

/// A logical backend derived from one or more instances sharing the same
/// service name, service port, and region.
///
/// A `Service` is rebuilt every cycle; it has no identity across cycles
/// other than its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub port: u16,
    pub region: String,
    /// Ordered as discovered; order determines stable server-slot indices.
    pub instances: Vec<ServiceInstance>,
}

/// An instance bound into a service, carrying the effective per-instance
/// server port alongside the instance it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub instance: Instance,
    /// The port the server record should dial: the per-instance port tag
    /// if present and parseable, else the service's port.
    pub effective_port: u16,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            port: self.port,
            region: self.region.clone(),
        }
    }
}

/// `prefix + sep + name + sep + port + sep + region` — the stable backend
/// identity in HAProxy.
pub fn backend_name(key: &ServiceKey, prefix: &str, sep: &str) -> String {
    format!(
        "{prefix}{sep}{name}{sep}{port}{sep}{region}",
        prefix = prefix,
        sep = sep,
        name = key.name,
        port = key.port,
        region = key.region,
    )
}

/// One instance's contribution to a backend's identity quintuple, used by
/// the change detector to decide whether a service changed between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFingerprint {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub zone: Option<String>,
    pub az_perc: Option<u8>,
}

/// Per-service state the change detector retains between cycles. Lives only
/// in memory; nothing survives a process restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendState {
    /// Last-known fingerprints, keyed by instance id.
    pub instances: BTreeMap<String, InstanceFingerprint>,
    /// Last-known server-slot count; never allowed to shrink.
    pub slot_count: u32,
}

impl BackendState {
    /// A quiesced state: no active instances, slot count preserved.
    pub fn quiesced(slot_count: u32) -> Self {
        Self {
            instances: BTreeMap::new(),
            slot_count,
        }
    }

    pub fn from_fingerprints(fingerprints: Vec<InstanceFingerprint>, slot_count: u32) -> Self {
        let instances = fingerprints
            .into_iter()
            .map(|fp| (fp.instance_id.clone(), fp))
            .collect();
        Self {
            instances,
            slot_count,
        }
    }
}

/// Deterministic server slot name: `"srv" + zero-padded index`, fixed width
/// for the lifetime of the backend so slot->name mapping never shifts.
pub fn slot_server_name(index: u32) -> String {
    format!("srv{index:04}")
}
