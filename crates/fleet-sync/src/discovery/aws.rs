//! AWS backend: enumerates EC2 instances directly and via Auto Scaling Group
//! membership, merging and deduplicating by instance id.
//!
//! Requests are signed with AWS Signature Version 4 via `hmac`/`sha2` rather
//! than pulled in via `aws-sdk-ec2` — this crate pins only the trait contract
//! and the shape of the returned `Instance` records (§6.1), not an AWS SDK.
//! The EC2 and Auto Scaling "Query" APIs return XML; only the handful of
//! fields the reconciler needs are scraped out.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_types::Instance;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::DiscoveryClient;
use crate::error::DiscoveryError;

type HmacSha256 = Hmac<Sha256>;

pub struct Ec2DiscoveryClient {
    client: reqwest::Client,
    region: String,
    asg_names: Vec<String>,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Ec2DiscoveryClient {
    pub fn new(region: String, asg_names: Vec<String>) -> Result<Self, DiscoveryError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| DiscoveryError::Credentials("AWS_ACCESS_KEY_ID is not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| DiscoveryError::Credentials("AWS_SECRET_ACCESS_KEY is not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        let client = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, region, asg_names, access_key_id, secret_access_key, session_token })
    }

    fn ec2_host(&self) -> String {
        format!("ec2.{}.amazonaws.com", self.region)
    }

    fn autoscaling_host(&self) -> String {
        format!("autoscaling.{}.amazonaws.com", self.region)
    }

    /// Signs and sends a query-protocol GET request to `host`, returning the
    /// raw XML response body.
    async fn signed_query(&self, host: &str, service: &str, params: &[(&str, String)]) -> Result<String, DiscoveryError> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut all_params: Vec<(String, String)> =
            params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        all_params.push(("X-Amz-Algorithm".into(), "AWS4-HMAC-SHA256".into()));
        let credential_scope = format!("{date_stamp}/{}/{service}/aws4_request", self.region);
        all_params.push(("X-Amz-Credential".into(), format!("{}/{credential_scope}", self.access_key_id)));
        all_params.push(("X-Amz-Date".into(), amz_date.clone()));
        all_params.push(("X-Amz-SignedHeaders".into(), "host".into()));
        if let Some(token) = &self.session_token {
            all_params.push(("X-Amz-Security-Token".into(), token.clone()));
        }
        all_params.sort();

        let canonical_query = all_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n/\n{canonical_query}\nhost:{host}\n\nhost\n{}",
            hex_sha256(b"")
        );
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}", hex_sha256(canonical_request.as_bytes()));

        let signing_key = signing_key(&self.secret_access_key, &date_stamp, &self.region, service);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let url = format!("https://{host}/?{canonical_query}&X-Amz-Signature={signature}");
        let response = self.client.get(url).header("host", host).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Api(format!("{service} request failed ({status}): {body}")));
        }
        Ok(response.text().await?)
    }

    async fn describe_running_instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let params = [
            ("Action", "DescribeInstances".to_string()),
            ("Version", "2016-11-15".to_string()),
            ("Filter.1.Name", "instance-state-name".to_string()),
            ("Filter.1.Value.1", "running".to_string()),
        ];
        let body = self.signed_query(&self.ec2_host(), "ec2", &params).await?;
        Ok(parse_ec2_instances(&body, &self.region))
    }

    async fn describe_instances_by_id(&self, ids: &[String]) -> Result<Vec<Instance>, DiscoveryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let indexed: Vec<(String, String)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("InstanceId.{}", i + 1), id.clone()))
            .collect();
        let mut owned: Vec<(&str, String)> =
            vec![("Action", "DescribeInstances".to_string()), ("Version", "2016-11-15".to_string())];
        owned.extend(indexed.iter().map(|(k, v)| (k.as_str(), v.clone())));
        let body = self.signed_query(&self.ec2_host(), "ec2", &owned).await?;
        Ok(parse_ec2_instances(&body, &self.region))
    }

    async fn asg_instance_ids(&self, asg_name: &str) -> Result<Vec<String>, DiscoveryError> {
        let params = [
            ("Action", "DescribeAutoScalingGroups".to_string()),
            ("Version", "2011-01-01".to_string()),
            ("AutoScalingGroupNames.member.1", asg_name.to_string()),
        ];
        let body = self.signed_query(&self.autoscaling_host(), "autoscaling", &params).await?;
        Ok(extract_all(&body, r"<InstanceId>([^<]+)</InstanceId>"))
    }
}

#[async_trait]
impl DiscoveryClient for Ec2DiscoveryClient {
    async fn discover_all(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut seen: BTreeMap<String, Instance> = BTreeMap::new();
        for instance in self.describe_running_instances().await? {
            seen.entry(instance.id.clone()).or_insert(instance);
        }

        for asg_name in &self.asg_names {
            debug!(asg_name, "resolving Auto Scaling Group membership");
            let ids = self.asg_instance_ids(asg_name).await?;
            for instance in self.describe_instances_by_id(&ids).await? {
                seen.entry(instance.id.clone()).or_insert(instance);
            }
        }

        Ok(seen.into_values().collect())
    }
}

/// Pulls `(id, ip, zone, tags)` tuples out of a `DescribeInstances` XML body.
/// Only the fields the reconciler needs are extracted; anything else in the
/// response is ignored.
fn parse_ec2_instances(xml: &str, region: &str) -> Vec<Instance> {
    let instance_re = Regex::new(r"(?s)<instanceId>([^<]+)</instanceId>.*?<privateIpAddress>([^<]+)</privateIpAddress>")
        .expect("valid regex");
    let zone_re = Regex::new(r"<availabilityZone>([^<]+)</availabilityZone>").expect("valid regex");
    let tag_re = Regex::new(r"(?s)<item><key>([^<]*)</key><value>([^<]*)</value></item>").expect("valid regex");

    // Split on instance boundaries so tag/zone extraction stays scoped to one instance.
    xml.split("<item><instanceId>")
        .skip(1)
        .filter_map(|chunk| {
            let chunk = format!("<instanceId>{chunk}");
            let caps = instance_re.captures(&chunk)?;
            let id = caps[1].to_string();
            let ip = caps[2].to_string();
            let zone = zone_re.captures(&chunk).map(|c| c[1].to_string());
            let tags = tag_re
                .captures_iter(&chunk)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect::<BTreeMap<_, _>>();
            Some(Instance { id, ip, region: region.to_string(), zone, tags })
        })
        .collect()
}

fn extract_all(xml: &str, pattern: &str) -> Vec<String> {
    Regex::new(pattern).expect("valid regex").captures_iter(xml).map(|c| c[1].to_string()).collect()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// AWS's flavor of URI percent-encoding: unreserved characters pass through,
/// everything else (including space) is `%XX` — never `+`.
fn uri_encode(input: &str) -> String {
    input
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}
