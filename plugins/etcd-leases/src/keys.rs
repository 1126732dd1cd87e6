//! Canonical key construction for everything this plugin writes.
//!
//! [`KeySchema`] is a pure, stateless resolver from entity to store key.
//! It owns the literal family tokens (`ips`, `nics`, `free`, `leased`,
//! `A`, `CNAME`); no other module concatenates keys.

use std::net::Ipv4Addr;

/// Default key separator.
pub const DEFAULT_SEPARATOR: &str = "::";

const IPS: &str = "ips";
const NICS: &str = "nics";
const FREE: &str = "free";
const LEASED: &str = "leased";
const RECORD_A: &str = "A";
const RECORD_CNAME: &str = "CNAME";

/// Builds keys of the form `prefix <sep> kind <sep> subkind <sep> id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    prefix: String,
    separator: String,
}

impl KeySchema {
    /// New schema; an empty `separator` falls back to [`DEFAULT_SEPARATOR`].
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        let separator: String = separator.into();
        Self {
            prefix: prefix.into(),
            separator: if separator.is_empty() {
                DEFAULT_SEPARATOR.to_owned()
            } else {
                separator
            },
        }
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push_str(&self.separator);
            key.push_str(part);
        }
        key
    }

    /// `prefix::ips::free::<ip>` — presence means the address is offerable.
    pub fn free_ip(&self, ip: Ipv4Addr) -> String {
        self.join(&[IPS, FREE, &ip.to_string()])
    }

    /// `prefix::ips::leased::<ip>` — value is the holder's hardware address.
    pub fn leased_ip(&self, ip: Ipv4Addr) -> String {
        self.join(&[IPS, LEASED, &ip.to_string()])
    }

    /// `prefix::nics::leased::<mac>` — value is the held IPv4 address.
    pub fn leased_nic(&self, mac: &str) -> String {
        self.join(&[NICS, LEASED, mac])
    }

    /// Scan prefix covering every free address.
    pub fn free_ip_prefix(&self) -> String {
        let mut key = self.join(&[IPS, FREE]);
        key.push_str(&self.separator);
        key
    }

    /// Scan prefix covering every leased address.
    pub fn leased_ip_prefix(&self) -> String {
        let mut key = self.join(&[IPS, LEASED]);
        key.push_str(&self.separator);
        key
    }

    /// `prefix::<zone>::A::<name>` — forward record.
    pub fn a_record(&self, zone: &str, name: &str) -> String {
        self.join(&[zone, RECORD_A, name])
    }

    /// `prefix::<zone>::CNAME::<alias>` — alias record.
    pub fn cname_record(&self, zone: &str, alias: &str) -> String {
        self.join(&[zone, RECORD_CNAME, alias])
    }

    /// The last separator-delimited token of a key (the entity id).
    pub fn leaf<'a>(&self, key: &'a str) -> &'a str {
        key.rsplit(&self.separator).next().unwrap_or(key)
    }
}

/// Render the first six `chaddr` bytes the way hardware addresses are
/// stored: lowercase hex, colon separated.
pub fn mac_string(chaddr: &[u8]) -> String {
    chaddr
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
