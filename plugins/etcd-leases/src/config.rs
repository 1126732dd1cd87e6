//! Plugin configuration, parsed from the multi-line `Key=Value` payload
//! the host dispatcher hands to [`setup`].
//!
//! [`setup`]: crate::setup

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::keys::DEFAULT_SEPARATOR;

/// Everything one plugin instance needs: store credentials, the managed
/// address range, the key namespace, and DNS subtree coordinates.
#[derive(Debug, Clone)]
pub struct Config {
    /// PEM file with the store CA certificate.
    pub ca: PathBuf,
    /// PEM file with the client certificate.
    pub cert: PathBuf,
    /// PEM file with the client private key.
    pub key: PathBuf,
    /// Store endpoints (comma separated in the payload).
    pub endpoints: Vec<String>,
    /// First address of the managed range (inclusive).
    pub start: Ipv4Addr,
    /// End of the managed range (exclusive).
    pub end: Ipv4Addr,
    /// Key prefix for everything this instance writes.
    pub prefix: String,
    /// Key separator, default `::`.
    pub separator: String,
    /// DNS zone the A/CNAME records are published under.
    pub dns_zone: String,
    /// Key prefix for the DNS subtree.
    pub dns_prefix: String,
    /// Static/alias names file; absent means no static names or aliases.
    pub dns_names: Option<PathBuf>,
}

impl Config {
    /// Parse the configuration payload. Blank lines and `#` comments are
    /// skipped, unknown keys ignored. Fails on malformed lines, invalid
    /// IPv4 literals, or a range whose start is not below its end.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut ca = None;
        let mut cert = None;
        let mut key = None;
        let mut endpoints = Vec::new();
        let mut start = None;
        let mut end = None;
        let mut prefix = None;
        let mut separator = None;
        let mut dns_zone = None;
        let mut dns_prefix = None;
        let mut dns_names = None;

        for line in payload.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                bail!("malformed config line (want Key=Value): {line}");
            };
            let value = value.trim();
            match name.trim() {
                "CA" => ca = Some(PathBuf::from(value)),
                "Cert" => cert = Some(PathBuf::from(value)),
                "Key" => key = Some(PathBuf::from(value)),
                "Endpoints" => {
                    endpoints = value
                        .split(',')
                        .map(str::trim)
                        .filter(|endpoint| !endpoint.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                "Start" => start = Some(parse_ipv4(value)?),
                "End" => end = Some(parse_ipv4(value)?),
                "Prefix" => prefix = Some(value.to_owned()),
                "Separator" => separator = Some(value.to_owned()),
                "DNSZone" => dns_zone = Some(value.to_owned()),
                "DNSPrefix" => dns_prefix = Some(value.to_owned()),
                "DNSNames" => {
                    if !value.is_empty() {
                        dns_names = Some(PathBuf::from(value));
                    }
                }
                unknown => debug!(key = unknown, "ignoring unknown config key"),
            }
        }

        let start = start.context("missing required config key 'Start'")?;
        let end = end.context("missing required config key 'End'")?;
        if u32::from(start) >= u32::from(end) {
            bail!("start of IP range has to be lower than the end of the IP range");
        }
        if endpoints.is_empty() {
            bail!("missing required config key 'Endpoints'");
        }

        Ok(Self {
            ca: ca.context("missing required config key 'CA'")?,
            cert: cert.context("missing required config key 'Cert'")?,
            key: key.context("missing required config key 'Key'")?,
            endpoints,
            start,
            end,
            prefix: prefix.unwrap_or_default(),
            separator: separator
                .filter(|sep| !sep.is_empty())
                .unwrap_or_else(|| DEFAULT_SEPARATOR.to_owned()),
            dns_zone: dns_zone.unwrap_or_default(),
            dns_prefix: dns_prefix.unwrap_or_default(),
            dns_names,
        })
    }
}

fn parse_ipv4(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .with_context(|| format!("invalid IPv4 address: {value}"))
}
