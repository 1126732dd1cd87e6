//! DNS record publication into the store, for an external DNS publisher
//! to serve from.
//!
//! On a successful lease the registry writes a forward record under the
//! configured zone. Three cases, decided in order: a static entry keyed
//! by hardware address publishes a TTL-less A record that survives lease
//! expiry; an alias maps the announced hostname to a canonical name and
//! publishes A(canonical) plus CNAME(hostname → canonical) under a fresh
//! store lease; anything else publishes A(hostname) under a fresh lease.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use etcd_kv::{KvStore, StoreResult};
use tracing::{debug, info};

use crate::keys::KeySchema;

/// Static and alias name mappings plus the key namespace they publish
/// under. Read-only after load.
#[derive(Debug, Clone)]
pub struct DnsRegistry {
    keys: KeySchema,
    zone: String,
    /// hardware address → static DNS name
    statics: HashMap<String, String>,
    /// announced hostname → canonical name
    aliases: HashMap<String, String>,
}

impl DnsRegistry {
    /// Build the registry; `names` points at the static/alias names file,
    /// absent meaning no mappings.
    pub fn new(
        prefix: impl Into<String>,
        zone: impl Into<String>,
        separator: impl Into<String>,
        names: Option<&Path>,
    ) -> Result<Self> {
        let (statics, aliases) = match names {
            Some(path) => load_names(path)?,
            None => Default::default(),
        };
        Ok(Self {
            keys: KeySchema::new(prefix, separator),
            zone: zone.into(),
            statics,
            aliases,
        })
    }

    /// The canonical name an announced hostname aliases, if any.
    pub fn canonical_for(&self, hostname: &str) -> Option<&str> {
        self.aliases.get(hostname).map(String::as_str)
    }

    /// The static name registered for a hardware address, if any.
    pub fn static_name(&self, mac: &str) -> Option<&str> {
        self.statics.get(mac).map(String::as_str)
    }

    /// Publish the records for a fresh lease. TTL-bound records are
    /// written under a newly granted store lease of `ttl`, so they never
    /// outlive the DHCP lease they describe.
    pub async fn register<S>(
        &self,
        store: &S,
        hostname: &str,
        ip: Ipv4Addr,
        mac: &str,
        ttl: Duration,
    ) -> StoreResult<()>
    where
        S: KvStore,
    {
        if let Some(name) = self.static_name(mac) {
            // static entries survive lease expiry
            let key = self.keys.a_record(&self.zone, name);
            store.put(&key, &ip.to_string(), None).await?;
            info!(%key, %ip, "registered static name");
        } else if let Some(canonical) = self.canonical_for(hostname) {
            let lease = store.grant(ttl).await?;
            let a_key = self.keys.a_record(&self.zone, canonical);
            let cname_key = self.keys.cname_record(&self.zone, hostname);
            store.put(&a_key, &ip.to_string(), Some(lease)).await?;
            store.put(&cname_key, canonical, Some(lease)).await?;
            info!(%a_key, %cname_key, %ip, "registered alias");
        } else {
            let lease = store.grant(ttl).await?;
            let key = self.keys.a_record(&self.zone, hostname);
            store.put(&key, &ip.to_string(), Some(lease)).await?;
            debug!(%key, %ip, "registered name");
        }
        Ok(())
    }
}

/// Parse the names file: line oriented, `#` comments and blank lines
/// skipped, exactly three whitespace-separated tokens per line.
/// `static <name> <mac>` or `alias <canonical> <alias>`.
fn load_names(path: &Path) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
    info!(path = %path.display(), "reading names");
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("could not read names file {}", path.display()))?;

    let mut statics = HashMap::new();
    let mut aliases = HashMap::new();

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            bail!("malformed line, want 3 fields, got {}: {line}", tokens.len());
        }
        match tokens[0] {
            "static" => {
                let mac = normalize_mac(tokens[2])
                    .with_context(|| format!("malformed hardware address: {}", tokens[2]))?;
                statics.insert(mac, tokens[1].to_owned());
            }
            "alias" => {
                aliases.insert(tokens[2].to_owned(), tokens[1].to_owned());
            }
            other => bail!("unknown names directive {other:?}: {line}"),
        }
    }

    Ok((statics, aliases))
}

/// Accept six `:` or `-` separated hex octets; normalize to the
/// lowercase colon form keys are built from.
fn normalize_mac(text: &str) -> Result<String> {
    let octets: Vec<&str> = if text.contains(':') {
        text.split(':').collect()
    } else {
        text.split('-').collect()
    };
    if octets.len() != 6 {
        bail!("want 6 octets, got {}", octets.len());
    }
    let mut parsed = Vec::with_capacity(6);
    for octet in octets {
        parsed.push(
            u8::from_str_radix(octet, 16).with_context(|| format!("bad octet {octet:?}"))?,
        );
    }
    Ok(crate::keys::mac_string(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_SEPARATOR;
    use etcd_kv::MemoryKv;
    use std::io::Write;

    const TTL: Duration = Duration::from_secs(600);

    fn registry(names: &str) -> DnsRegistry {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(names.as_bytes()).unwrap();
        DnsRegistry::new("dhcp", "example.com", DEFAULT_SEPARATOR, Some(file.path())).unwrap()
    }

    #[test]
    fn loads_statics_and_aliases() {
        let registry = registry(
            "# fleet names\n\
             \n\
             static printer AA-BB-CC-00-00-09\n\
             alias www host1\n",
        );
        assert_eq!(registry.static_name("aa:bb:cc:00:00:09"), Some("printer"));
        assert_eq!(registry.canonical_for("host1"), Some("www"));
        assert_eq!(registry.canonical_for("host2"), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"static printer\n").unwrap();
        let err = DnsRegistry::new("dhcp", "z", "::", Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("want 3 fields"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"static printer zz:bb:cc:00:00:09\n").unwrap();
        assert!(DnsRegistry::new("dhcp", "z", "::", Some(file.path())).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"cname www host1\n").unwrap();
        let err = DnsRegistry::new("dhcp", "z", "::", Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("unknown names directive"));
    }

    #[test]
    fn no_names_file_means_empty_registry() {
        let registry = DnsRegistry::new("dhcp", "z", "::", None).unwrap();
        assert_eq!(registry.static_name("aa:bb:cc:00:00:09"), None);
        assert_eq!(registry.canonical_for("host1"), None);
    }

    #[tokio::test]
    async fn plain_hostname_gets_ttl_bound_a_record() {
        let store = MemoryKv::new();
        let registry = DnsRegistry::new("dhcp", "example.com", "::", None).unwrap();
        registry
            .register(
                &store,
                "host9",
                Ipv4Addr::new(10, 0, 0, 12),
                "aa:bb:cc:00:00:04",
                TTL,
            )
            .await
            .unwrap();

        let key = "dhcp::example.com::A::host9";
        assert_eq!(store.get(key).await.unwrap(), Some("10.0.0.12".into()));
        assert!(store.lease_of(key).is_some());

        store.expire_all_leases();
        assert_eq!(store.get(key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn alias_publishes_a_and_cname_under_one_lease() {
        let store = MemoryKv::new();
        let registry = registry("alias www host1\n");
        registry
            .register(
                &store,
                "host1",
                Ipv4Addr::new(10, 0, 0, 12),
                "aa:bb:cc:00:00:04",
                TTL,
            )
            .await
            .unwrap();

        assert_eq!(
            store.get("dhcp::example.com::A::www").await.unwrap(),
            Some("10.0.0.12".into())
        );
        assert_eq!(
            store.get("dhcp::example.com::CNAME::host1").await.unwrap(),
            Some("www".into())
        );
        assert_eq!(
            store.lease_of("dhcp::example.com::A::www"),
            store.lease_of("dhcp::example.com::CNAME::host1"),
        );
    }

    #[tokio::test]
    async fn static_record_survives_lease_expiry() {
        let store = MemoryKv::new();
        let registry = registry("static printer aa:bb:cc:00:00:09\n");
        registry
            .register(
                &store,
                "whatever",
                Ipv4Addr::new(10, 0, 0, 11),
                "aa:bb:cc:00:00:09",
                TTL,
            )
            .await
            .unwrap();

        store.expire_all_leases();
        assert_eq!(
            store.get("dhcp::example.com::A::printer").await.unwrap(),
            Some("10.0.0.11".into())
        );
    }
}
