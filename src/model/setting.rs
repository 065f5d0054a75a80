//! The setting catalog.
//!
//! Every dynamically-configurable knob is described by a [`Setting`]
//! descriptor: where it may apply, whether it is keyed, when a change to it
//! takes effect, and how raw string values are parsed and validated.
//! Descriptors are data; the change algebra dispatches on them exhaustively.

use crate::error::{CaravanError, Result};
use crate::model::applicability::Scope;
use crate::model::{Authc, FailoverPriority};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// When a committed change to a setting takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Applied to the running process immediately on commit.
    AtRuntime,
    /// Applied on commit but only effective after a restart.
    RequiresRestart,
    /// Only settable before activation.
    ConfigurationOnly,
}

/// A typed setting descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Setting {
    ClusterName,
    FailoverPriority,
    ClientReconnectWindow,
    ClientLeaseDuration,
    OffheapResources,
    NodeName,
    NodeHostname,
    NodePort,
    NodeGroupPort,
    NodeBindAddress,
    DataDirs,
    NodeLogDir,
    NodeBackupDir,
    NodeMetadataDir,
    NodeAuditLogDir,
    SecuritySslTls,
    SecurityAuthc,
    SecurityWhitelist,
    SecurityDir,
    TcProperties,
    NodeLoggerOverrides,
}

impl Setting {
    /// The full catalog, in display order.
    pub const ALL: [Setting; 21] = [
        Setting::ClusterName,
        Setting::FailoverPriority,
        Setting::ClientReconnectWindow,
        Setting::ClientLeaseDuration,
        Setting::OffheapResources,
        Setting::NodeName,
        Setting::NodeHostname,
        Setting::NodePort,
        Setting::NodeGroupPort,
        Setting::NodeBindAddress,
        Setting::DataDirs,
        Setting::NodeLogDir,
        Setting::NodeBackupDir,
        Setting::NodeMetadataDir,
        Setting::NodeAuditLogDir,
        Setting::SecuritySslTls,
        Setting::SecurityAuthc,
        Setting::SecurityWhitelist,
        Setting::SecurityDir,
        Setting::TcProperties,
        Setting::NodeLoggerOverrides,
    ];

    /// Kebab-case setting name as used on the wire and by operators.
    pub fn name(&self) -> &'static str {
        match self {
            Setting::ClusterName => "cluster-name",
            Setting::FailoverPriority => "failover-priority",
            Setting::ClientReconnectWindow => "client-reconnect-window",
            Setting::ClientLeaseDuration => "client-lease-duration",
            Setting::OffheapResources => "offheap-resources",
            Setting::NodeName => "node-name",
            Setting::NodeHostname => "node-hostname",
            Setting::NodePort => "node-port",
            Setting::NodeGroupPort => "node-group-port",
            Setting::NodeBindAddress => "node-bind-address",
            Setting::DataDirs => "data-dirs",
            Setting::NodeLogDir => "node-log-dir",
            Setting::NodeBackupDir => "node-backup-dir",
            Setting::NodeMetadataDir => "node-metadata-dir",
            Setting::NodeAuditLogDir => "node-audit-log-dir",
            Setting::SecuritySslTls => "security-ssl-tls",
            Setting::SecurityAuthc => "security-authc",
            Setting::SecurityWhitelist => "security-whitelist",
            Setting::SecurityDir => "security-dir",
            Setting::TcProperties => "tc-properties",
            Setting::NodeLoggerOverrides => "node-logger-overrides",
        }
    }

    /// Scopes this setting may be addressed at.
    pub fn allowed_scopes(&self) -> &'static [Scope] {
        use Scope::*;
        match self {
            Setting::ClusterName
            | Setting::FailoverPriority
            | Setting::ClientReconnectWindow
            | Setting::ClientLeaseDuration
            | Setting::OffheapResources => &[Cluster],
            // Stripe-addressed settings fan out to every node of the stripe.
            Setting::DataDirs | Setting::TcProperties | Setting::NodeLoggerOverrides => {
                &[Cluster, Stripe, Node]
            }
            Setting::NodeName
            | Setting::NodeHostname
            | Setting::NodePort
            | Setting::NodeGroupPort
            | Setting::NodeBindAddress
            | Setting::NodeLogDir
            | Setting::NodeBackupDir
            | Setting::NodeMetadataDir
            | Setting::NodeAuditLogDir => &[Node],
            Setting::SecuritySslTls
            | Setting::SecurityAuthc
            | Setting::SecurityWhitelist => &[Cluster],
            Setting::SecurityDir => &[Cluster, Stripe, Node],
        }
    }

    pub fn allows_scope(&self, scope: Scope) -> bool {
        self.allowed_scopes().contains(&scope)
    }

    /// Whether the setting is a keyed map (`name=value` per key) rather than
    /// a scalar.
    pub fn is_map(&self) -> bool {
        matches!(
            self,
            Setting::OffheapResources
                | Setting::DataDirs
                | Setting::TcProperties
                | Setting::NodeLoggerOverrides
        )
    }

    /// Whether activation requires this setting to be present.
    pub fn required_at_activation(&self) -> bool {
        matches!(self, Setting::ClusterName | Setting::FailoverPriority)
    }

    pub fn mutability(&self) -> Mutability {
        match self {
            Setting::ClusterName
            | Setting::ClientReconnectWindow
            | Setting::ClientLeaseDuration
            | Setting::OffheapResources
            | Setting::NodeBackupDir
            | Setting::TcProperties
            | Setting::NodeLoggerOverrides => Mutability::AtRuntime,
            Setting::FailoverPriority
            | Setting::DataDirs
            | Setting::NodeLogDir
            | Setting::NodeAuditLogDir
            | Setting::SecuritySslTls
            | Setting::SecurityAuthc
            | Setting::SecurityWhitelist
            | Setting::SecurityDir => Mutability::RequiresRestart,
            Setting::NodeName
            | Setting::NodeHostname
            | Setting::NodePort
            | Setting::NodeGroupPort
            | Setting::NodeBindAddress
            | Setting::NodeMetadataDir => Mutability::ConfigurationOnly,
        }
    }

    /// Factory default for scalar settings, when one exists.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Setting::FailoverPriority => Some("availability"),
            Setting::ClientReconnectWindow => Some("120s"),
            Setting::ClientLeaseDuration => Some("20s"),
            Setting::NodePort => Some("9410"),
            Setting::NodeGroupPort => Some("9430"),
            Setting::NodeBindAddress => Some("0.0.0.0"),
            Setting::NodeLogDir => Some("logs"),
            Setting::NodeMetadataDir => Some("metadata"),
            Setting::SecuritySslTls | Setting::SecurityWhitelist => Some("false"),
            _ => None,
        }
    }

    /// Whether `unset` is a legal operation for this setting.
    pub fn can_unset(&self) -> bool {
        matches!(
            self,
            Setting::OffheapResources
                | Setting::DataDirs
                | Setting::NodeLogDir
                | Setting::NodeBackupDir
                | Setting::NodeAuditLogDir
                | Setting::SecurityAuthc
                | Setting::SecurityDir
                | Setting::TcProperties
                | Setting::NodeLoggerOverrides
        )
    }

    /// Validate a raw value for this setting. `key` must be present exactly
    /// for map settings.
    pub fn validate(&self, key: Option<&str>, value: &str) -> Result<()> {
        if self.is_map() && key.is_none() {
            return Err(self.invalid("a key is required for map settings"));
        }
        if !self.is_map() && key.is_some() {
            return Err(self.invalid("keys are not allowed for scalar settings"));
        }
        match self {
            Setting::ClusterName | Setting::NodeName | Setting::NodeHostname => {
                if value.trim().is_empty() {
                    return Err(self.invalid("must not be empty"));
                }
            }
            Setting::FailoverPriority => {
                value.parse::<FailoverPriority>().map_err(|e| self.invalid(&e))?;
            }
            Setting::ClientReconnectWindow | Setting::ClientLeaseDuration => {
                let duration = parse_duration(value).map_err(|e| self.invalid(&e))?;
                if duration.is_zero() {
                    return Err(self.invalid("must be positive"));
                }
            }
            Setting::OffheapResources => {
                let size = parse_size(value).map_err(|e| self.invalid(&e))?;
                if size == 0 {
                    return Err(self.invalid("size must be greater than zero"));
                }
            }
            Setting::NodePort | Setting::NodeGroupPort => {
                let port = value.parse::<u16>().map_err(|_| self.invalid("invalid port"))?;
                if port == 0 {
                    return Err(self.invalid("port must be non-zero"));
                }
            }
            Setting::NodeBindAddress => {
                if value.trim().is_empty() {
                    return Err(self.invalid("must not be empty"));
                }
            }
            Setting::DataDirs
            | Setting::NodeLogDir
            | Setting::NodeBackupDir
            | Setting::NodeMetadataDir
            | Setting::NodeAuditLogDir
            | Setting::SecurityDir => {
                if value.trim().is_empty() {
                    return Err(self.invalid("path must not be empty"));
                }
            }
            Setting::SecuritySslTls | Setting::SecurityWhitelist => {
                value.parse::<bool>().map_err(|_| self.invalid("expected true or false"))?;
            }
            Setting::SecurityAuthc => {
                value.parse::<Authc>().map_err(|e| self.invalid(&e))?;
            }
            Setting::TcProperties => {}
            Setting::NodeLoggerOverrides => {
                parse_log_level(value).map_err(|e| self.invalid(&e))?;
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> CaravanError {
        CaravanError::InvalidValue {
            setting: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Setting {
    type Err = CaravanError;

    fn from_str(s: &str) -> Result<Self> {
        Setting::ALL
            .iter()
            .find(|setting| setting.name() == s)
            .copied()
            .ok_or_else(|| CaravanError::UnknownSetting(s.to_string()))
    }
}

/// Parse a duration value such as `120s` or `2m 30s`.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value.trim()).map_err(|e| e.to_string())
}

/// Parse a memory size such as `512MB`, `1GB` or a plain byte count.
pub fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let quantity = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid size: {}", value))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        "TB" | "T" => 1024u64.pow(4),
        other => return Err(format!("invalid size unit: {}", other)),
    };
    quantity
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {}", value))
}

/// Render a byte count back into the largest exact unit.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1024u64.pow(4)),
        ("GB", 1024u64.pow(3)),
        ("MB", 1024 * 1024),
        ("KB", 1024),
    ];
    for (unit, size) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{}", bytes / size, unit);
        }
    }
    format!("{}B", bytes)
}

fn parse_log_level(value: &str) -> std::result::Result<(), String> {
    match value.to_ascii_uppercase().as_str() {
        "TRACE" | "DEBUG" | "INFO" | "WARN" | "ERROR" | "OFF" => Ok(()),
        other => Err(format!("invalid log level: {}", other)),
    }
}
