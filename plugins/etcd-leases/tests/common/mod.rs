//! Shared test fixtures: a plugin over the in-memory store plus packet
//! builders that mimic what the host dispatcher hands the plugin.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;

use dhcproto::v4::{DhcpOption, Message, MessageType, OptionCode};
use etcd_kv::MemoryKv;
use etcd_leases::{Config, EtcdLeases};

/// The server address replies are stamped with.
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Start of the managed range (inclusive).
pub const RANGE_START: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);

/// End of the managed range (exclusive).
pub const RANGE_END: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 13);

/// Test MACs share a fixed OUI and vary the last byte.
pub fn mac(last: u8) -> [u8; 6] {
    [0xaa, 0xbb, 0xcc, 0, 0, last]
}

pub fn mac_text(last: u8) -> String {
    format!("aa:bb:cc:00:00:{last:02x}")
}

pub fn config(dns_names: Option<PathBuf>) -> Config {
    Config {
        ca: "/unused/ca.pem".into(),
        cert: "/unused/cert.pem".into(),
        key: "/unused/key.pem".into(),
        endpoints: vec!["https://unused:2379".into()],
        start: RANGE_START,
        end: RANGE_END,
        prefix: "dhcp".into(),
        separator: "::".into(),
        dns_zone: "example.com".into(),
        dns_prefix: "dhcp".into(),
        dns_names,
    }
}

pub async fn plugin(store: MemoryKv) -> EtcdLeases<MemoryKv> {
    EtcdLeases::with_store(store, config(None)).await.unwrap()
}

pub async fn plugin_with_names(store: MemoryKv, names: PathBuf) -> EtcdLeases<MemoryKv> {
    EtcdLeases::with_store(store, config(Some(names)))
        .await
        .unwrap()
}

fn base_msg(msg_type: MessageType, chaddr: &[u8]) -> Message {
    let uns = Ipv4Addr::UNSPECIFIED;
    let mut msg = Message::new(uns, uns, uns, uns, chaddr);
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg
}

pub fn discover(chaddr: &[u8]) -> Message {
    base_msg(MessageType::Discover, chaddr)
}

/// REQUEST with the requested-IP option and our server identifier.
pub fn request(chaddr: &[u8], requested: Ipv4Addr) -> Message {
    let mut msg = base_msg(MessageType::Request, chaddr);
    msg.opts_mut()
        .insert(DhcpOption::RequestedIpAddress(requested));
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    msg
}

pub fn release(chaddr: &[u8]) -> Message {
    let mut msg = base_msg(MessageType::Release, chaddr);
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    msg
}

/// The prepared reply the host's earlier stages would hand over: server
/// identifier and `siaddr` stamped, message type already set to the
/// positive answer for the request's type.
pub fn reply_for(req: &Message) -> Message {
    let uns = Ipv4Addr::UNSPECIFIED;
    let mut msg =
        Message::new_with_id(req.xid(), uns, uns, SERVER_IP, req.giaddr(), req.chaddr());
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    let msg_type = match req.opts().msg_type() {
        Some(MessageType::Discover) => MessageType::Offer,
        _ => MessageType::Ack,
    };
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg
}

/// Lease-time option of a reply, in seconds.
pub fn lease_secs(msg: &Message) -> Option<u32> {
    match msg.opts().get(OptionCode::AddressLeaseTime) {
        Some(DhcpOption::AddressLeaseTime(secs)) => Some(*secs),
        _ => None,
    }
}
