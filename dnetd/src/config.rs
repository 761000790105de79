//! The daemon's configuration surface: a TOML file with a `[node]`
//! section, per-subsystem `[logging]` levels, and one table per circuit
//! (`[[ethernet]]`, `[[bridge]]`, `[[ddcmp]]`), up to the routing
//! layer's circuit limit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use dnet_packet::NodeAddr;
use dnet_routing::{RouterLevel, NA, NC, NN};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "could not open the configuration file: {}", err),
            Self::Parse(err) => write!(f, "could not parse the configuration file: {}", err),
            Self::Invalid(what) => write!(f, "{}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(what: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(what.into())
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub node: NodeSection,
    #[serde(default)]
    pub logging: BTreeMap<String, String>,
    pub socket: Option<SocketSection>,
    #[serde(default)]
    pub ethernet: Vec<EthernetSection>,
    #[serde(default)]
    pub bridge: Vec<BridgeSection>,
    #[serde(default)]
    pub ddcmp: Vec<DdcmpSection>,
    pub dns: Option<DnsSection>,
}

#[derive(Deserialize, Debug)]
pub struct NodeSection {
    pub address: String,
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

#[derive(Deserialize, Debug)]
pub struct SocketSection {
    #[serde(rename = "TcpListenPort", alias = "tcp_listen_port")]
    pub tcp_listen_port: u16,
}

#[derive(Deserialize, Debug)]
pub struct EthernetSection {
    pub interface: String,
    #[serde(default = "default_ethernet_cost")]
    pub cost: u16,
}

#[derive(Deserialize, Debug)]
pub struct BridgeSection {
    /// `host:port` of the far end of the tunnel.
    pub address: String,
    /// Local UDP port to listen on.
    pub port: u16,
    #[serde(default = "default_line_cost")]
    pub cost: u16,
}

#[derive(Deserialize, Debug)]
pub struct DdcmpSection {
    /// Host the circuit expects connections from.
    pub address: String,
    #[serde(default = "default_line_cost")]
    pub cost: u16,
}

#[derive(Deserialize, Debug)]
pub struct DnsSection {
    pub address: String,
    pub poll: u64,
}

fn default_level() -> u8 {
    2
}

fn default_priority() -> u8 {
    64
}

fn default_ethernet_cost() -> u16 {
    3
}

fn default_line_cost() -> u16 {
    5
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.node_address()?;

        if self.node.name.is_empty() || self.node.name.len() > 6 {
            return Err(invalid("node name must be 1 to 6 characters"));
        }

        if !matches!(self.node.level, 1 | 2) {
            return Err(invalid("node level must be 1 or 2"));
        }

        if self.node.priority > 127 {
            return Err(invalid("node priority must be 0 to 127"));
        }

        let circuits = self.ethernet.len() + self.bridge.len() + self.ddcmp.len();
        if circuits == 0 {
            return Err(invalid("No circuits defined"));
        }
        if circuits > NC {
            return Err(invalid(format!("too many circuit definitions, at most {}", NC)));
        }

        if !self.ddcmp.is_empty() && self.socket.is_none() {
            return Err(invalid(
                "socket section required in configuration file for DDCMP circuits",
            ));
        }

        for circuit in &self.ethernet {
            if circuit.interface.is_empty() {
                return Err(invalid("interface not defined for ethernet circuit"));
            }
            if circuit.cost == 0 {
                return Err(invalid("circuit cost must be greater than 0"));
            }
        }

        for circuit in &self.bridge {
            split_host_port(&circuit.address)?;
            if circuit.cost == 0 {
                return Err(invalid("circuit cost must be greater than 0"));
            }
        }

        for circuit in &self.ddcmp {
            if circuit.address.is_empty() {
                return Err(invalid("address not defined for DDCMP circuit"));
            }
            if circuit.cost == 0 {
                return Err(invalid("circuit cost must be greater than 0"));
            }
        }

        for level in self.logging.values() {
            parse_log_level(level)
                .ok_or_else(|| invalid(format!("unknown logging level: {}", level)))?;
        }

        Ok(())
    }

    pub fn node_address(&self) -> Result<NodeAddr, ConfigError> {
        let (area, node) = self
            .node
            .address
            .split_once('.')
            .ok_or_else(|| invalid("node address must be in the form <area>.<node>"))?;

        let area: u8 = area
            .parse()
            .map_err(|_| invalid("node address must be in the form <area>.<node>"))?;
        let node: u16 = node
            .parse()
            .map_err(|_| invalid("node address must be in the form <area>.<node>"))?;

        if area == 0 || area as usize > NA || node == 0 || node as usize > NN {
            return Err(invalid("node address out of range"));
        }

        Ok(NodeAddr::new(area, node))
    }

    pub fn level(&self) -> RouterLevel {
        if self.node.level == 1 {
            RouterLevel::Level1
        } else {
            RouterLevel::Level2
        }
    }
}

pub fn split_host_port(address: &str) -> Result<(&str, u16), ConfigError> {
    let (host, port) = address
        .split_once(':')
        .ok_or_else(|| invalid("bridge address must be of the form <host>:<port>"))?;

    let port: u16 = port
        .parse()
        .map_err(|_| invalid("bridge address must be of the form <host>:<port>"))?;

    Ok((host, port))
}

/// Configuration level names to the log facade's filters. `fatal` has no
/// separate filter level; fatal conditions are reported at error level
/// on their way to a non-zero exit.
pub fn parse_log_level(name: &str) -> Option<log::LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" | "error" => Some(log::LevelFilter::Error),
        "warning" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "detail" => Some(log::LevelFilter::Debug),
        "verbose" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

/// Maps a `[logging]` subsystem name to the module whose records it
/// controls.
pub fn subsystem_module(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "general" => Some("dnetd"),
        "circuit" => Some("dnet_routing::circuit"),
        "adjacency" => Some("dnet_routing::adjacency"),
        "update" => Some("dnet_routing::update"),
        "decision" => Some("dnet_routing::decision"),
        "forwarding" => Some("dnet_routing::forwarding"),
        "messages" => Some("dnet_packet"),
        "routing" => Some("dnet_routing::router"),
        "dns" => Some("dnetd::dns"),
        "ethinit" => Some("dnet_routing::eth_init"),
        "ethpcap" | "ethsock" | "sock" => Some("dnetd::lines"),
        "ddcmpsock" => Some("dnetd::lines"),
        "ddcmp" => Some("dnet_ddcmp"),
        "ddcmpinit" => Some("dnet_routing::ddcmp_init"),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_ethernet_config() {
        let config = Config::parse(
            r#"
            [node]
            address = "1.100"
            name = "RTR"

            [[ethernet]]
            interface = "eth0"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_address().unwrap(), NodeAddr::new(1, 100));
        assert_eq!(config.level(), RouterLevel::Level2);
        assert_eq!(config.node.priority, 64);
        assert_eq!(config.ethernet[0].cost, 3);
    }

    #[test]
    fn no_circuits_is_rejected() {
        // A node with nothing to route over refuses to start.
        let err = Config::parse(
            r#"
            [node]
            address = "1.100"
            name = "RTR"
            level = 2
            priority = 64
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("No circuits defined"));
    }

    #[test]
    fn ddcmp_requires_listener() {
        let err = Config::parse(
            r#"
            [node]
            address = "1.100"
            name = "RTR"

            [[ddcmp]]
            address = "peer.example.org"
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("socket section required"));
    }

    #[test]
    fn full_config() {
        let config = Config::parse(
            r#"
            [node]
            address = "5.1021"
            name = "HUB"
            level = 1
            priority = 96

            [logging]
            adjacency = "verbose"
            ddcmp = "detail"

            [socket]
            TcpListenPort = 700

            [[ethernet]]
            interface = "eth1"
            cost = 4

            [[bridge]]
            address = "far.example.org:4711"
            port = 4711

            [[ddcmp]]
            address = "pdp11.example.org"
            cost = 9

            [dns]
            address = "192.168.0.1"
            poll = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.node_address().unwrap(), NodeAddr::new(5, 1021));
        assert_eq!(config.level(), RouterLevel::Level1);
        assert_eq!(config.socket.unwrap().tcp_listen_port, 700);
        assert_eq!(config.bridge[0].port, 4711);
        assert_eq!(
            split_host_port(&config.bridge[0].address).unwrap(),
            ("far.example.org", 4711)
        );
        assert_eq!(config.ddcmp[0].cost, 9);
        assert_eq!(config.dns.unwrap().poll, 300);
        assert_eq!(
            parse_log_level(&config.logging["adjacency"]),
            Some(log::LevelFilter::Trace)
        );
    }

    #[test]
    fn too_many_circuits_rejected() {
        let mut text = String::from("[node]\naddress = \"1.1\"\nname = \"R\"\n");
        for i in 0..9 {
            text.push_str(&format!("[[ethernet]]\ninterface = \"eth{}\"\n", i));
        }

        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("too many circuit definitions"));
    }

    #[test]
    fn bad_address_rejected() {
        for address in ["1-100", "0.5", "64.5", "1.0", "1.1024", "frob"] {
            let text = format!(
                "[node]\naddress = \"{}\"\nname = \"R\"\n[[ethernet]]\ninterface = \"eth0\"\n",
                address
            );
            assert!(Config::parse(&text).is_err(), "{} accepted", address);
        }
    }
}
