use pnet::datalink::{self, NetworkInterface};
use serde_derive::Serialize;

/// A local network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Addresses in CIDR form, e.g. `192.168.1.10/24`.
    pub addresses: Vec<String>,
    pub up: bool,
    pub loopback: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            mac: iface.mac.map(|mac| mac.to_string()),
            addresses: iface.ips.iter().map(ToString::to_string).collect(),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
        }
    }
}

pub(super) fn list() -> Vec<InterfaceInfo> {
    datalink::interfaces()
        .iter()
        .map(InterfaceInfo::from)
        .collect()
}
