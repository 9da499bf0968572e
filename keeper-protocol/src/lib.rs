use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// State of the agent service as reported by the service control manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    /// Start or stop pending; never counts as running.
    Pending,
    NotFound,
    /// The service manager could not be asked; treated as not running.
    Unknown,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    pub fn exists(&self) -> bool {
        !matches!(self, ServiceStatus::NotFound)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Running => "Running",
            ServiceStatus::Stopped => "Stopped",
            ServiceStatus::Pending => "Pending",
            ServiceStatus::NotFound => "NotFound",
            ServiceStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Dotted numeric version such as `23.9.8.8811`.
///
/// Missing trailing components compare as zero, so `23.9` equals `23.9.0.0`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentVersion {
    parts: Vec<u64>,
}

impl AgentVersion {
    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for AgentVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty version string".to_string());
        }

        let parts = trimmed
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| format!("invalid version component '{}' in '{}'", p, trimmed))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { parts })
    }
}

impl TryFrom<String> for AgentVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentVersion> for String {
    fn from(version: AgentVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        f.write_str(&rendered.join("."))
    }
}

impl PartialEq for AgentVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

/// Entry from the installed-programs (uninstall) registry hive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledProgram {
    pub display_name: String,
    pub version: Option<AgentVersion>,
    pub install_date: Option<NaiveDate>,
    pub product_code: Option<String>,
}

/// Repair ladder rungs, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    Restart,
    Reinstall,
    ForceReinstall,
}

impl RepairStep {
    pub fn next(&self) -> Option<RepairStep> {
        match self {
            RepairStep::Restart => Some(RepairStep::Reinstall),
            RepairStep::Reinstall => Some(RepairStep::ForceReinstall),
            RepairStep::ForceReinstall => None,
        }
    }
}

impl fmt::Display for RepairStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepairStep::Restart => "restart",
            RepairStep::Reinstall => "reinstall",
            RepairStep::ForceReinstall => "force-reinstall",
        };
        f.write_str(s)
    }
}

/// Why an installed agent is considered out of date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Staleness {
    TooOld { installed: NaiveDate, age_days: i64 },
    BelowFloor { installed: AgentVersion, floor: AgentVersion },
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::TooOld { installed, age_days } => {
                write!(f, "installed on {} ({} days ago)", installed, age_days)
            }
            Staleness::BelowFloor { installed, floor } => {
                write!(f, "version {} is below required {}", installed, floor)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// Running and current, nothing was touched.
    Healthy,
    /// Was not running; the given step brought it back.
    Repaired { step: RepairStep },
    /// Was stale; the given step brought it up to date.
    Updated { step: RepairStep },
    ServiceDown,
    StillStale { reason: Staleness },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::ServiceDown | Outcome::StillStale { .. })
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_failure() {
            1
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Outcome::Healthy => "agent running and current".to_string(),
            Outcome::Repaired { step } => format!("agent repaired by {}", step),
            Outcome::Updated { step } => format!("agent updated by {}", step),
            Outcome::ServiceDown => "agent service is not running after all repair steps".to_string(),
            Outcome::StillStale { reason } => {
                format!("agent still out of date after forced reinstall: {}", reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmmPlatform {
    Datto,
    Syncro,
    Standalone,
}

impl fmt::Display for RmmPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RmmPlatform::Datto => "datto",
            RmmPlatform::Syncro => "syncro",
            RmmPlatform::Standalone => "standalone",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub service_name: String,
    pub platform: RmmPlatform,
    pub status: ServiceStatus,
    pub installed: Option<InstalledProgram>,
    pub outcome: Outcome,
    pub steps_taken: Vec<RepairStep>,
    pub join_url: Option<String>,
}

impl RunReport {
    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> AgentVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("23.9.8.8811") > v("23.9.7.9999"));
        assert!(v("24.1") > v("23.9.8.8811"));
        assert!(v("6.10") > v("6.9"));
        assert_eq!(v("23.9"), v("23.9.0.0"));
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!("".parse::<AgentVersion>().is_err());
        assert!("23.x.1".parse::<AgentVersion>().is_err());
        assert!("23..1".parse::<AgentVersion>().is_err());
    }

    #[test]
    fn test_version_serializes_as_string() {
        let json = serde_json::to_string(&v("23.9.8")).unwrap();
        assert_eq!(json, "\"23.9.8\"");
        let back: AgentVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("23.9.8"));
    }

    #[test]
    fn test_unknown_status_is_down_but_present() {
        assert!(!ServiceStatus::Unknown.is_running());
        assert!(ServiceStatus::Unknown.exists());
        assert!(!ServiceStatus::NotFound.exists());
    }

    #[test]
    fn test_ladder_order() {
        assert_eq!(RepairStep::Restart.next(), Some(RepairStep::Reinstall));
        assert_eq!(RepairStep::Reinstall.next(), Some(RepairStep::ForceReinstall));
        assert_eq!(RepairStep::ForceReinstall.next(), None);
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::Healthy.exit_code(), 0);
        assert_eq!(
            Outcome::Repaired {
                step: RepairStep::Restart
            }
            .exit_code(),
            0
        );
        assert_eq!(Outcome::ServiceDown.exit_code(), 1);
        let stale = Outcome::StillStale {
            reason: Staleness::BelowFloor {
                installed: v("22.1"),
                floor: v("23.9.8"),
            },
        };
        assert_eq!(stale.exit_code(), 1);
    }

    #[test]
    fn test_installed_program_date_format() {
        let program = InstalledProgram {
            display_name: "ScreenConnect Client (abc)".to_string(),
            version: Some(v("23.9.8.8811")),
            install_date: NaiveDate::from_ymd_opt(2024, 1, 15),
            product_code: None,
        };
        let json = serde_json::to_value(&program).unwrap();
        assert_eq!(json["install_date"], "2024-01-15");
        assert_eq!(json["version"], "23.9.8.8811");
    }
}
