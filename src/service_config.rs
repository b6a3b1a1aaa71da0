//! The JSON service config a resolver may attach to a resolution, carrying
//! the load balancing policy choice and per-method call defaults.
//!
//! Deserialized with `serde` rather than a hand-rolled parser; the shape
//! itself follows the usual gRPC service config JSON schema.

use serde::Deserialize;
use std::time::Duration;

/// One entry of `loadBalancingConfig`: a policy name plus its
/// policy-specific options, deserialized lazily since only the first
/// policy this channel recognizes is ever inspected in full.
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct LoadBalancingConfigEntry {
    inner: serde_json::Map<String, serde_json::Value>,
}

impl LoadBalancingConfigEntry {
    /// The single key of this object is the policy name.
    pub fn policy_name(&self) -> Option<&str> {
        self.inner.keys().next().map(String::as_str)
    }

    pub fn policy_config(&self) -> Option<&serde_json::Value> {
        self.policy_name().and_then(|name| self.inner.get(name))
    }
}

/// Matches one or more RPC methods by `service[/method]`; an entry with
/// neither `service` nor `method` set matches every call (the default
/// entry).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MethodName {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

fn deserialize_duration_string<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) => {
            let s = s.strip_suffix('s').unwrap_or(&s);
            s.parse::<f64>()
                .map(|secs| Some(Duration::from_secs_f64(secs)))
                .map_err(serde::de::Error::custom)
        }
        None => Ok(None),
    }
}

/// Per-method defaults: call timeout and retry/hedging knobs. Retry and
/// hedging policies are parsed for forward compatibility but not
/// interpreted by this runtime.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MethodConfig {
    #[serde(default)]
    pub name: Vec<MethodName>,
    #[serde(default, deserialize_with = "deserialize_duration_string", rename = "timeout")]
    pub timeout: Option<Duration>,
    #[serde(default, rename = "waitForReady")]
    pub wait_for_ready: Option<bool>,
    #[serde(default, rename = "maxRequestMessageBytes")]
    pub max_request_message_bytes: Option<u64>,
    #[serde(default, rename = "maxResponseMessageBytes")]
    pub max_response_message_bytes: Option<u64>,
}

impl MethodConfig {
    /// Whether `name` (`"/service/method"`) matches one of this entry's
    /// `MethodName`s: exact service+method, service-only wildcard, or the
    /// fully-empty default-for-everything entry.
    pub fn matches(&self, service: &str, method: &str) -> bool {
        self.name.iter().any(|n| match (&n.service, &n.method) {
            (None, None) => true,
            (Some(s), None) => s == service,
            (Some(s), Some(m)) => s == service && m == method,
            (None, Some(_)) => false,
        })
    }
}

/// The parsed service config document: a load balancing policy preference
/// list plus per-method call configuration. Deserialized directly from the
/// JSON the resolver (or a TXT record) provided.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, rename = "loadBalancingConfig")]
    pub load_balancing_config: Vec<LoadBalancingConfigEntry>,
    #[serde(default, rename = "methodConfig")]
    pub method_config: Vec<MethodConfig>,
}

impl ServiceConfig {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The first `loadBalancingConfig` entry naming a policy this channel
    /// has a `LoadBalancer` implementation for. `known_policies` is checked
    /// in list order, honoring the config's own priority.
    pub fn select_load_balancing_policy<'a>(
        &'a self,
        known_policies: &[&str],
    ) -> Option<&'a LoadBalancingConfigEntry> {
        self.load_balancing_config.iter().find(|entry| {
            entry
                .policy_name()
                .map(|name| known_policies.contains(&name))
                .unwrap_or(false)
        })
    }

    /// The most specific `MethodConfig` applicable to `/service/method`:
    /// exact match first, then service-wildcard, then the catch-all.
    pub fn method_config_for(&self, service: &str, method: &str) -> Option<&MethodConfig> {
        self.method_config
            .iter()
            .filter(|mc| mc.matches(service, method))
            .max_by_key(|mc| {
                mc.name
                    .iter()
                    .map(|n| match (&n.service, &n.method) {
                        (Some(_), Some(_)) => 2,
                        (Some(_), None) => 1,
                        _ => 0,
                    })
                    .max()
                    .unwrap_or(0)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_and_method_config() {
        let json = r#"{
            "loadBalancingConfig": [{"round_robin": {}}],
            "methodConfig": [{
                "name": [{"service": "Echo", "method": "Say"}],
                "timeout": "3.5s",
                "waitForReady": true
            }]
        }"#;
        let sc = ServiceConfig::parse(json).unwrap();
        let policy = sc.select_load_balancing_policy(&["pick_first", "round_robin"]).unwrap();
        assert_eq!(policy.policy_name(), Some("round_robin"));

        let mc = sc.method_config_for("Echo", "Say").unwrap();
        assert_eq!(mc.timeout, Some(Duration::from_millis(3500)));
        assert_eq!(mc.wait_for_ready, Some(true));
    }

    #[test]
    fn falls_back_to_wildcard_method_config() {
        let json = r#"{
            "methodConfig": [
                {"name": [{"service": "Echo"}], "timeout": "1s"},
                {"name": [], "timeout": "9s"}
            ]
        }"#;
        let sc = ServiceConfig::parse(json).unwrap();
        assert_eq!(
            sc.method_config_for("Echo", "Say").unwrap().timeout,
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            sc.method_config_for("Other", "Thing").unwrap().timeout,
            Some(Duration::from_secs(9))
        );
    }

    #[test]
    fn skips_unknown_load_balancing_policies() {
        let json = r#"{"loadBalancingConfig": [{"grpclb": {}}, {"pick_first": {}}]}"#;
        let sc = ServiceConfig::parse(json).unwrap();
        let policy = sc.select_load_balancing_policy(&["pick_first"]).unwrap();
        assert_eq!(policy.policy_name(), Some("pick_first"));
    }
}
