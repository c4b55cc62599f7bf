//! Allow/deny evaluation over instance tags (§4.1).
//!
//! Filtering happens before grouping: an instance without the required
//! service-name/service-port tags cannot be assigned a `ServiceKey` at all,
//! so it is dropped here rather than surfacing as a later panic.

use fleet_types::Instance;
use tracing::debug;

use crate::config::TagsConfig;
use crate::error::TagParseError;

/// An instance that passed required-tag and allow/deny evaluation, carrying
/// its parsed service port alongside the raw instance.
pub struct FilteredInstance {
    pub instance: Instance,
    pub service_name: String,
    pub service_port: u16,
}

/// Apply required-tag extraction and allow/deny rules to `instances`.
///
/// Instances missing a required tag, or whose service-port tag does not
/// parse to 1..=65535, are dropped and logged at DEBUG. Surviving instances
/// must match every allowlist entry and no denylist entry.
pub fn filter(instances: Vec<Instance>, tags: &TagsConfig) -> Vec<FilteredInstance> {
    instances
        .into_iter()
        .filter_map(|instance| match extract(&instance, tags) {
            Ok((service_name, service_port)) => {
                if !matches_allowlist(&instance, &tags.allowlist) {
                    debug!(instance_id = %instance.id, "dropped: allowlist mismatch");
                    return None;
                }
                if matches_denylist(&instance, &tags.denylist) {
                    debug!(instance_id = %instance.id, "dropped: denylist match");
                    return None;
                }
                Some(FilteredInstance { instance, service_name, service_port })
            }
            Err(err) => {
                debug!(instance_id = %instance.id, error = %err, "dropped: tag parse error");
                None
            }
        })
        .collect()
}

fn extract(instance: &Instance, tags: &TagsConfig) -> Result<(String, u16), TagParseError> {
    let name = instance
        .tag(&tags.service_name_tag)
        .ok_or_else(|| TagParseError::MissingTag(tags.service_name_tag.clone()))?
        .to_string();
    let port_raw = instance
        .tag(&tags.service_port_tag)
        .ok_or_else(|| TagParseError::MissingTag(tags.service_port_tag.clone()))?;
    let port = parse_port(port_raw).ok_or_else(|| TagParseError::InvalidPort {
        tag: tags.service_port_tag.clone(),
        value: port_raw.to_string(),
    })?;
    Ok((name, port))
}

fn parse_port(raw: &str) -> Option<u16> {
    let value: u32 = raw.parse().ok()?;
    if value >= 1 && value <= 65535 {
        Some(value as u16)
    } else {
        None
    }
}

fn matches_allowlist(instance: &Instance, allowlist: &std::collections::BTreeMap<String, String>) -> bool {
    allowlist.iter().all(|(key, value)| instance.tag(key) == Some(value.as_str()))
}

fn matches_denylist(instance: &Instance, denylist: &std::collections::BTreeMap<String, String>) -> bool {
    denylist.iter().any(|(key, value)| instance.tag(key) == Some(value.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn instance(tags: &[(&str, &str)]) -> Instance {
        Instance {
            id: "i-1".into(),
            ip: "10.0.0.1".into(),
            region: "eastus".into(),
            zone: None,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn tags_config() -> TagsConfig {
        TagsConfig {
            service_name_tag: "HAProxy:Service:Name".into(),
            service_port_tag: "HAProxy:Service:Port".into(),
            instance_port_tag: "HAProxy:Instance:Port".into(),
            az_weight_tag: "HAProxy:Instance:AZperc".into(),
            allowlist: BTreeMap::new(),
            denylist: BTreeMap::new(),
        }
    }

    #[test]
    fn drops_instance_missing_service_name() {
        let inst = instance(&[("HAProxy:Service:Port", "8080")]);
        let result = filter(vec![inst], &tags_config());
        assert!(result.is_empty());
    }

    #[test]
    fn drops_instance_with_unparseable_port() {
        let inst = instance(&[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", "not-a-port")]);
        let result = filter(vec![inst], &tags_config());
        assert!(result.is_empty());
    }

    #[test]
    fn keeps_matching_instance() {
        let inst = instance(&[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", "8080")]);
        let result = filter(vec![inst], &tags_config());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].service_name, "web");
        assert_eq!(result[0].service_port, 8080);
    }

    #[test]
    fn denylist_drops_match() {
        let inst = instance(&[
            ("HAProxy:Service:Name", "web"),
            ("HAProxy:Service:Port", "8080"),
            ("env", "canary"),
        ]);
        let mut tags = tags_config();
        tags.denylist.insert("env".into(), "canary".into());
        let result = filter(vec![inst], &tags);
        assert!(result.is_empty());
    }

    #[test]
    fn allowlist_requires_all_entries() {
        let inst = instance(&[
            ("HAProxy:Service:Name", "web"),
            ("HAProxy:Service:Port", "8080"),
            ("team", "payments"),
        ]);
        let mut tags = tags_config();
        tags.allowlist.insert("team".into(), "payments".into());
        tags.allowlist.insert("tier".into(), "gold".into());
        let result = filter(vec![inst], &tags);
        assert!(result.is_empty());
    }
}
