//! Member configuration (spec §3): immutable once the cluster has joined.
//!
//! Validation rules come straight from §3 and from the resolved open
//! question in §9: `instance_id` is accepted iff its length is 2..=32 and
//! every character is ASCII alphanumeric (the source's inverted check is
//! not reproduced here).

use uuid::Uuid;

use crate::error::{ClusterError, Result};

pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_TTL_SECONDS: u64 = 120;
pub const DEFAULT_REFRESH_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkPolicy {
    #[default]
    ChildOnly,
    ParentOnly,
    Both,
}

/// Where a cluster's registry lives, already resolved from a URI scheme.
#[derive(Debug, Clone)]
pub enum RegistryEndpoint {
    Kv(String),
    Sql(String),
    Static,
}

/// Member configuration. Mutated only through `Cluster`'s setters, all of
/// which reject changes once the cluster has joined (spec §6).
#[derive(Debug, Clone)]
pub struct MemberConfig {
    pub key: String,
    pub environment: String,
    pub partition: Option<String>,
    pub instance_id: String,
    pub workers: u32,
    pub ttl_seconds: u64,
    pub refresh_seconds: u64,
    pub registry_endpoint: RegistryEndpoint,
    pub mode: Mode,
    pub fork_policy: ForkPolicy,
    pub static_index: Option<i64>,
    pub static_total: Option<u64>,
}

impl MemberConfig {
    /// `make_cluster(key)` — the only required field; everything else takes
    /// its spec-mandated default.
    pub fn new(key: &str) -> Result<Self> {
        validate_key(key)?;
        Ok(MemberConfig {
            key: key.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            partition: None,
            instance_id: generate_hex_token(),
            workers: 1,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            refresh_seconds: DEFAULT_REFRESH_SECONDS,
            registry_endpoint: RegistryEndpoint::Static,
            mode: Mode::Active,
            fork_policy: ForkPolicy::default(),
            static_index: None,
            static_total: None,
        })
    }
}

/// A fresh 32-char hex token derived from a 128-bit random identifier, dashes
/// stripped. Used both for an unset `instance_id` and for an unset job id
/// (spec §3, §6).
pub fn generate_hex_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 32 {
        return Err(ClusterError::Invalid(format!(
            "key must be 1..=32 characters, got {}",
            key.len()
        )));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ClusterError::Invalid(
            "key must be alphanumeric/hyphen only".to_string(),
        ));
    }
    Ok(())
}

/// Accept iff 2 <= len <= 32 and every character is ASCII alphanumeric.
pub fn validate_instance_id(id: &str) -> Result<()> {
    let len = id.len();
    if !(2..=32).contains(&len) {
        return Err(ClusterError::Invalid(format!(
            "instance_id must be 2..=32 characters, got {}",
            len
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ClusterError::Invalid(
            "instance_id must be alphanumeric".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_partition(partition: &str) -> Result<()> {
    if partition.is_empty() || partition.len() > 32 {
        return Err(ClusterError::Invalid(format!(
            "partition must be 1..=32 characters, got {}",
            partition.len()
        )));
    }
    Ok(())
}

pub fn validate_workers(workers: u32) -> Result<()> {
    if workers == 0 {
        return Err(ClusterError::Invalid(
            "workers must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Parse a registry endpoint URI per spec §6: `http(s)` -> KV, a recognized
/// SQL scheme -> SQL, `None` -> static. Unrecognized schemes are `Invalid`.
pub fn parse_registry_endpoint(uri: Option<&str>) -> Result<RegistryEndpoint> {
    let Some(uri) = uri else {
        return Ok(RegistryEndpoint::Static);
    };
    let scheme = uri.split_once("://").map(|(s, _)| s).unwrap_or("");
    match scheme {
        "http" | "https" => Ok(RegistryEndpoint::Kv(uri.to_string())),
        "postgres" | "postgresql" => Ok(RegistryEndpoint::Sql(uri.to_string())),
        other => Err(ClusterError::Invalid(format!(
            "unrecognized registry scheme {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rejects_empty_and_overlong() {
        assert!(validate_key("").is_err());
        assert!(validate_key(&"a".repeat(33)).is_err());
        assert!(validate_key(&"a".repeat(32)).is_ok());
    }

    #[test]
    fn key_rejects_non_alphanumeric() {
        assert!(validate_key("cluster_name").is_err());
        assert!(validate_key("cluster-name").is_ok());
    }

    #[test]
    fn instance_id_accepts_two_to_thirty_two_alphanumeric() {
        assert!(validate_instance_id("a1").is_ok());
        assert!(validate_instance_id(&"a".repeat(32)).is_ok());
        assert!(validate_instance_id("a").is_err());
        assert!(validate_instance_id(&"a".repeat(33)).is_err());
        assert!(validate_instance_id("has-dash").is_err());
    }

    #[test]
    fn generated_instance_id_is_32_hex_chars() {
        let id = generate_hex_token();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_hex_token());
    }

    #[test]
    fn registry_endpoint_selects_backend_by_scheme() {
        assert!(matches!(
            parse_registry_endpoint(None).unwrap(),
            RegistryEndpoint::Static
        ));
        assert!(matches!(
            parse_registry_endpoint(Some("https://kv.example.com")).unwrap(),
            RegistryEndpoint::Kv(_)
        ));
        assert!(matches!(
            parse_registry_endpoint(Some("postgres://localhost/db")).unwrap(),
            RegistryEndpoint::Sql(_)
        ));
        assert!(parse_registry_endpoint(Some("redis://localhost")).is_err());
    }
}
