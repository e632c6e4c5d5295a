//! Device identification strategy.
//!
//! "Which peripheral is the device" differs by host platform: Linux exposes
//! MAC addresses, Apple platforms hide them behind opaque identifiers. The
//! selector folds both into one value so call sites never branch on the
//! platform: an address match wins when available, otherwise the advertised
//! service UUID or a configured name substring identifies the device.

use std::str::FromStr;

use uuid::Uuid;

use crate::UART_SERVICE_UUID;

/// BLE address type, relevant only where the platform exposes addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl FromStr for AddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            other => Err(format!("unknown address type: {other}")),
        }
    }
}

/// How a scan decided a peripheral is compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    /// The peripheral advertises the UART service UUID.
    ServiceUuid,
    /// Its local name contains a configured pattern.
    NamePattern,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ServiceUuid => "service-uuid",
            DetectionMethod::NamePattern => "name-pattern",
        }
    }
}

/// Identifies the device among scan results.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    /// Exact address, for platforms that expose one.
    pub address: Option<String>,
    pub address_type: AddressType,
    /// Case-insensitive substrings matched against the advertised local name.
    pub name_patterns: Vec<String>,
}

impl DeviceSelector {
    /// Compatibility check used by scans. The service UUID match dominates
    /// the name match when both apply.
    pub fn detect(&self, local_name: Option<&str>, services: &[Uuid]) -> Option<DetectionMethod> {
        if services.contains(&UART_SERVICE_UUID) {
            return Some(DetectionMethod::ServiceUuid);
        }
        if let Some(name) = local_name {
            let lower = name.to_lowercase();
            if self
                .name_patterns
                .iter()
                .any(|p| lower.contains(&p.to_lowercase()))
            {
                return Some(DetectionMethod::NamePattern);
            }
        }
        None
    }

    /// Whether `address` is the configured target address.
    pub fn matches_address(&self, address: &str) -> bool {
        self.address
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(address))
    }

    /// Connection targeting: the configured address when we have one,
    /// otherwise anything `detect` accepts.
    pub fn is_target(&self, address: &str, local_name: Option<&str>, services: &[Uuid]) -> bool {
        if self.address.is_some() {
            return self.matches_address(address);
        }
        self.detect(local_name, services).is_some()
    }
}
