use anyhow::Result;
use keeper_protocol::{AgentVersion, RmmPlatform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SERVICE_PREFIX: &str = "ScreenConnect Client (";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub agent: AgentConfig,
    pub installer: InstallerConfig,
    pub staleness: StalenessConfig,
    pub rmm: RmmConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Full service name, e.g. `ScreenConnect Client (0123456789abcdef)`.
    pub service_name: String,
    pub server_domain: String,
    /// Defaults to the per-thumbprint folder under Program Files (x86).
    pub install_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub company: Option<String>,
    pub site: Option<String>,
    pub session_group: String,
    pub friendly_name: Option<String>,
    pub sha256: Option<String>,
    pub download_dir: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            company: None,
            site: None,
            session_group: "All Machines".to_string(),
            friendly_name: None,
            sha256: None,
            download_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub max_install_age_days: i64,
    pub min_version: Option<AgentVersion>,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            max_install_age_days: 365,
            min_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlatformChoice {
    #[default]
    Auto,
    Datto,
    Syncro,
    #[serde(alias = "none")]
    #[value(alias = "none")]
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RmmConfig {
    pub platform: PlatformChoice,
    /// Datto: `Custom1`..`Custom30`. Syncro: asset custom field name.
    pub url_field: Option<String>,
    pub alert_category: String,
    pub publish_url: bool,
}

impl Default for RmmConfig {
    fn default() -> Self {
        Self {
            platform: PlatformChoice::Auto,
            url_field: None,
            alert_category: "ScreenConnect".to_string(),
            publish_url: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seconds to wait after each repair step before re-checking.
    pub settle_seconds: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { settle_seconds: 10 }
    }
}

impl KeeperConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: KeeperConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads the file when present, otherwise starts from defaults.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if tokio::fs::try_exists(path.as_ref()).await? {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.server_domain.trim().is_empty() {
            return Err(anyhow::anyhow!("server_domain is required"));
        }
        if self.agent.server_domain.contains("://") || self.agent.server_domain.contains('/') {
            return Err(anyhow::anyhow!(
                "server_domain must be a bare host name, got '{}'",
                self.agent.server_domain
            ));
        }

        self.thumbprint()?;

        if self.staleness.max_install_age_days <= 0 {
            return Err(anyhow::anyhow!("max_install_age_days must be positive"));
        }

        if self.rmm.platform == PlatformChoice::Datto {
            self.validate_for(RmmPlatform::Datto)?;
        }

        Ok(())
    }

    /// Checks settings that depend on the platform the host resolved to.
    pub fn validate_for(&self, platform: RmmPlatform) -> Result<()> {
        if platform == RmmPlatform::Datto {
            if let Some(field) = &self.rmm.url_field {
                datto_field_number(field)?;
            }
        }
        Ok(())
    }

    /// The hex id between the parentheses of the service name.
    pub fn thumbprint(&self) -> Result<&str> {
        let name = self.agent.service_name.trim();
        if name.is_empty() {
            return Err(anyhow::anyhow!("service_name is required"));
        }

        name.strip_prefix(SERVICE_PREFIX)
            .and_then(|rest| rest.strip_suffix(')'))
            .filter(|thumb| !thumb.is_empty() && thumb.chars().all(|c| c.is_ascii_alphanumeric()))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "service_name '{}' is not of the form '{}<thumbprint>)'",
                    name,
                    SERVICE_PREFIX
                )
            })
    }

    pub fn install_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.agent.install_dir {
            return Ok(dir.clone());
        }
        Ok(PathBuf::from(format!(
            r"C:\Program Files (x86)\ScreenConnect Client ({})",
            self.thumbprint()?
        )))
    }

    pub fn download_dir(&self) -> PathBuf {
        self.installer
            .download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Parses a Datto user-defined field name (`Custom7`) into its slot number.
pub fn datto_field_number(field: &str) -> Result<u8> {
    let slot = field
        .strip_prefix("Custom")
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| (1..=30).contains(n))
        .ok_or_else(|| anyhow::anyhow!("Datto field must be Custom1..Custom30, got '{}'", field))?;
    Ok(slot)
}
