//! Vendor CLI dialect: the commands we send and how we read the replies.
//!
//! Everything here is pure string work so it can be tested without a switch.
//! The transport ([`super::ssh`]) decides how the text reaches the device.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::{InterfaceName, VlanId};

/// Output markers Cisco CLIs print when a command is rejected.
const ERROR_MARKERS: &[&str] = &[
    "% Invalid",
    "% Incomplete",
    "% Ambiguous",
    "% Unknown",
    "% Bad",
    "% Error",
    "ERROR:",
];

/// Supported switch operating systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    CiscoIos,
    CiscoXe,
    CiscoNxos,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::CiscoIos => "cisco_ios",
            DeviceType::CiscoXe => "cisco_xe",
            DeviceType::CiscoNxos => "cisco_nxos",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported device type: {0} (expected cisco_ios, cisco_xe or cisco_nxos)")]
pub struct UnsupportedDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnsupportedDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cisco_ios" | "ios" => Ok(DeviceType::CiscoIos),
            "cisco_xe" | "ios_xe" => Ok(DeviceType::CiscoXe),
            "cisco_nxos" | "nxos" => Ok(DeviceType::CiscoNxos),
            _ => Err(UnsupportedDeviceType(s.to_string())),
        }
    }
}

/// Command builder and output reader for one device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliDialect {
    pub device_type: DeviceType,
    /// Append the save command to every configuration script.
    pub save_config: bool,
}

impl CliDialect {
    pub fn new(device_type: DeviceType, save_config: bool) -> Self {
        CliDialect {
            device_type,
            save_config,
        }
    }

    /// Exec command listing one VLAN.
    pub fn show_vlan(&self, vlan: VlanId) -> String {
        format!("show vlan id {}", vlan)
    }

    /// Exec command describing an interface's switchport settings.
    pub fn show_switchport(&self, interface: &InterfaceName) -> String {
        match self.device_type {
            DeviceType::CiscoNxos => format!("show interface {} switchport", interface),
            DeviceType::CiscoIos | DeviceType::CiscoXe => {
                format!("show interfaces {} switchport", interface)
            }
        }
    }

    fn save_command(&self) -> &'static str {
        match self.device_type {
            DeviceType::CiscoNxos => "copy running-config startup-config",
            DeviceType::CiscoIos | DeviceType::CiscoXe => "write memory",
        }
    }

    /// Wraps configuration lines in `configure terminal` / `end`, then saves.
    fn config_script(&self, body: &[String]) -> Vec<String> {
        let mut script = Vec::with_capacity(body.len() + 4);
        script.push("terminal length 0".to_string());
        script.push("configure terminal".to_string());
        script.extend(body.iter().cloned());
        script.push("end".to_string());
        if self.save_config {
            script.push(self.save_command().to_string());
        }
        script
    }

    pub fn create_vlan_script(&self, vlan: VlanId, name: &str) -> Vec<String> {
        self.config_script(&[
            format!("vlan {}", vlan),
            format!("name {}", name),
            "exit".to_string(),
        ])
    }

    pub fn set_interface_vlan_script(&self, interface: &InterfaceName, vlan: VlanId) -> Vec<String> {
        self.config_script(&[
            format!("interface {}", interface),
            "switchport mode access".to_string(),
            format!("switchport access vlan {}", vlan),
            "exit".to_string(),
        ])
    }

    pub fn set_interface_admin_up_script(&self, interface: &InterfaceName) -> Vec<String> {
        self.config_script(&[
            format!("interface {}", interface),
            "no shutdown".to_string(),
            "exit".to_string(),
        ])
    }
}

/// The deterministic name given to VLANs this service creates.
pub fn vlan_name(prefix: &str, vlan: VlanId) -> String {
    format!("{}-{}", prefix, vlan)
}

/// Returns the first line of `output` that signals a rejected command.
pub fn find_error(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| ERROR_MARKERS.iter().any(|marker| line.starts_with(marker)))
}

/// Interprets the output of [`CliDialect::show_vlan`].
///
/// IOS prints `VLAN id 20 not found in current VLAN database`; NX-OS prints
/// `ERROR: VLAN 20 not found`. A present VLAN has a table row starting with its
/// id. Anything else is reported as unrecognized output.
pub fn parse_vlan_exists(output: &str, vlan: VlanId) -> Result<bool, String> {
    let lowered = output.to_ascii_lowercase();
    if lowered.contains("not found") {
        return Ok(false);
    }
    if let Some(line) = find_error(output) {
        return Err(line.to_string());
    }

    let id = vlan.to_string();
    let present = output.lines().any(|line| {
        let mut cols = line.split_whitespace();
        cols.next() == Some(id.as_str())
    });
    if present {
        Ok(true)
    } else {
        Err(format!("unrecognized 'show vlan' output for VLAN {}", vlan))
    }
}

/// Extracts the access VLAN from the output of [`CliDialect::show_switchport`].
///
/// ```
/// use switchport_webhook::switch::cli::parse_access_vlan;
///
/// let output = "Name: Gi1/0/1\nAdministrative Mode: static access\nAccess Mode VLAN: 20 (VLAN0020)\n";
/// assert_eq!(parse_access_vlan(output).unwrap().get(), 20);
/// ```
pub fn parse_access_vlan(output: &str) -> Result<VlanId, String> {
    if let Some(line) = find_error(output) {
        return Err(line.to_string());
    }

    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Access Mode VLAN:"))
        .ok_or_else(|| "no 'Access Mode VLAN' line in switchport output".to_string())?;

    let token = value.split_whitespace().next().unwrap_or_default();
    token
        .parse::<u16>()
        .ok()
        .and_then(|v| VlanId::new(v).ok())
        .ok_or_else(|| format!("unparseable access VLAN: {:?}", value.trim()))
}
