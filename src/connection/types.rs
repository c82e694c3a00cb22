//! Connection data model

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Stopped => "Stopped",
            ConnectionStatus::Starting => "Starting",
            ConnectionStatus::Running => "Running",
            ConnectionStatus::Stopping => "Stopping",
        };
        f.write_str(s)
    }
}

/// What a connection forwards to on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LocalTarget {
    /// A serial device, exposed through a bridge on `bridge_port`
    Serial {
        device: String,
        baud_rate: u32,
        bridge_port: u16,
    },
    Tcp { ip: IpAddr, port: u16 },
}

impl LocalTarget {
    pub fn is_serial(&self) -> bool {
        matches!(self, LocalTarget::Serial { .. })
    }

    /// Port the tunnel client forwards to on the loopback or LAN side
    pub fn local_port(&self) -> u16 {
        match self {
            LocalTarget::Serial { bridge_port, .. } => *bridge_port,
            LocalTarget::Tcp { port, .. } => *port,
        }
    }

    /// Address written into the tunnel configuration
    pub fn local_ip(&self) -> String {
        match self {
            LocalTarget::Serial { .. } => "127.0.0.1".to_string(),
            LocalTarget::Tcp { ip, .. } => ip.to_string(),
        }
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalTarget::Serial {
                device, baud_rate, ..
            } => write!(f, "{}@{}", device, baud_rate),
            LocalTarget::Tcp { ip, port } => write!(f, "{}:{}", ip, port),
        }
    }
}

/// Snapshot of one connection as reported by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub remote_port: u16,
    pub target: LocalTarget,
    pub status: ConnectionStatus,
    pub pid: Option<u32>,
}

/// An unvalidated request for a new mapping, as typed by a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingRequest {
    Serial {
        device: String,
        baud_rate: u32,
        remote_port: u32,
    },
    Tcp {
        ip: String,
        port: u32,
        remote_port: u32,
    },
}

impl MappingRequest {
    pub fn remote_port(&self) -> u32 {
        match self {
            MappingRequest::Serial { remote_port, .. } | MappingRequest::Tcp { remote_port, .. } => *remote_port,
        }
    }

    /// Parse `DEVICE:BAUD:REMOTE`. The device may itself contain colons.
    pub fn parse_serial(spec: &str) -> Result<Self, String> {
        let mut parts = spec.rsplitn(3, ':');
        let (Some(remote), Some(baud), Some(device)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected DEVICE:BAUD:REMOTE, got '{}'", spec));
        };
        Ok(MappingRequest::Serial {
            device: device.to_string(),
            baud_rate: parse_number("baud rate", baud)?,
            remote_port: parse_number("public port", remote)?,
        })
    }

    /// Parse `IP:PORT:REMOTE`. IPv6 addresses may be given bare or in brackets.
    pub fn parse_tcp(spec: &str) -> Result<Self, String> {
        let mut parts = spec.rsplitn(3, ':');
        let (Some(remote), Some(port), Some(ip)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected IP:PORT:REMOTE, got '{}'", spec));
        };
        Ok(MappingRequest::Tcp {
            ip: ip.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: parse_number("local port", port)?,
            remote_port: parse_number("public port", remote)?,
        })
    }
}

fn parse_number(name: &str, value: &str) -> Result<u32, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{} must be numeric, got '{}'", name, value))
}

/// Local bridge port for a serial connection: `base + remote_port % span`
pub fn derive_bridge_port(remote_port: u16, base: u16, span: u16) -> u16 {
    let span = span.max(1);
    base.saturating_add(remote_port % span)
}

/// Accept only 1-65535
pub fn check_remote_port(remote_port: u32) -> Option<u16> {
    match u16::try_from(remote_port) {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_bridge_port_derivation() {
        assert_eq!(derive_bridge_port(3000, 20000, 1000), 20000);
        assert_eq!(derive_bridge_port(3389, 20000, 1000), 20389);
        assert_eq!(derive_bridge_port(12345, 20000, 1000), 20345);
        assert_eq!(derive_bridge_port(22, 20000, 1000), 20022);
        assert_eq!(derive_bridge_port(65535, 20000, 1000), 20535);
    }

    #[test]
    fn test_remote_port_range() {
        assert_eq!(check_remote_port(0), None);
        assert_eq!(check_remote_port(1), Some(1));
        assert_eq!(check_remote_port(65535), Some(65535));
        assert_eq!(check_remote_port(65536), None);
    }

    #[test]
    fn test_target_local_side() {
        let serial = LocalTarget::Serial {
            device: "COM3".to_string(),
            baud_rate: 115200,
            bridge_port: 23000,
        };
        assert!(serial.is_serial());
        assert_eq!(serial.local_ip(), "127.0.0.1");
        assert_eq!(serial.local_port(), 23000);
        assert_eq!(serial.to_string(), "COM3@115200");

        let tcp = LocalTarget::Tcp {
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 3389,
        };
        assert_eq!(tcp.local_ip(), "192.168.1.20");
        assert_eq!(tcp.local_port(), 3389);
    }

    #[test]
    fn test_parse_mapping_specs() {
        assert_eq!(
            MappingRequest::parse_serial("/dev/ttyUSB0:115200:3000").unwrap(),
            MappingRequest::Serial {
                device: "/dev/ttyUSB0".to_string(),
                baud_rate: 115200,
                remote_port: 3000,
            }
        );
        assert_eq!(
            MappingRequest::parse_tcp("[::1]:22:2222").unwrap(),
            MappingRequest::Tcp {
                ip: "::1".to_string(),
                port: 22,
                remote_port: 2222,
            }
        );
        assert_eq!(MappingRequest::parse_tcp("10.0.0.5:3389:13389").unwrap().remote_port(), 13389);
        assert!(MappingRequest::parse_serial("COM3:fast:3000").is_err());
        assert!(MappingRequest::parse_tcp("10.0.0.5:3389").is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Running.to_string(), "Running");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
