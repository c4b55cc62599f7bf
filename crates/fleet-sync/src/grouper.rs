//! Folds filtered instances into `Service`s keyed by (name, port, region) (§4.2).

use std::collections::BTreeMap;

use fleet_types::{Service, ServiceInstance};

use crate::config::TagsConfig;
use crate::tag_filter::FilteredInstance;

/// Group `filtered` into services, preserving discovery order and
/// deduplicating by instance id (first occurrence wins).
pub fn group(filtered: Vec<FilteredInstance>, tags: &TagsConfig) -> Vec<Service> {
    let mut order: Vec<(String, u16, String)> = Vec::new();
    let mut services: BTreeMap<(String, u16, String), (Vec<ServiceInstance>, std::collections::BTreeSet<String>)> =
        BTreeMap::new();

    for entry in filtered {
        let key = (entry.service_name.clone(), entry.service_port, entry.instance.region.clone());
        let effective_port = entry
            .instance
            .tag(&tags.instance_port_tag)
            .and_then(|raw| raw.parse::<u32>().ok())
            .filter(|p| *p >= 1 && *p <= 65535)
            .map(|p| p as u16)
            .unwrap_or(entry.service_port);

        let (instances, seen) = services.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            (Vec::new(), std::collections::BTreeSet::new())
        });

        if seen.insert(entry.instance.id.clone()) {
            instances.push(ServiceInstance { instance: entry.instance, effective_port });
        }
    }

    order
        .into_iter()
        .map(|key| {
            let (instances, _) = services.remove(&key).expect("key present");
            Service { name: key.0, port: key.1, region: key.2, instances }
        })
        .collect()
}
