use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::KeeperConfig;
use crate::rmm::HostContext;

pub const INSTALLER_FILE: &str = "ScreenConnect.ClientSetup.msi";

const MSI_SUCCESS_REBOOT_INITIATED: i32 = 1641;
const MSI_SUCCESS_REBOOT_REQUIRED: i32 = 3010;
const MSI_UNKNOWN_PRODUCT: i32 = 1605;

/// Number of custom property slots the installer URL carries.
const CUSTOM_PROPERTY_SLOTS: usize = 8;

/// Install and removal of the agent package.
#[allow(async_fn_in_trait)]
pub trait PackageInstaller {
    /// Download the current package and install it over whatever is present.
    async fn install(&self) -> Result<()>;

    /// Remove an installed package by its MSI product code.
    async fn uninstall(&self, product_code: &str) -> Result<()>;

    /// Delete leftover program files.
    async fn purge_files(&self, dir: &Path) -> Result<()>;
}

/// Builds the client setup URL for this host.
///
/// The first two custom properties carry company and site; the rest are sent
/// empty so the server keeps its slot order.
pub fn installer_url(config: &KeeperConfig, host: &HostContext) -> Result<Url> {
    let friendly_name = config
        .installer
        .friendly_name
        .clone()
        .or_else(|| host.computer_name.clone())
        .unwrap_or_default();
    let company = config
        .installer
        .company
        .clone()
        .or_else(|| host.profile_name.clone())
        .unwrap_or_default();
    let site = config.installer.site.clone().unwrap_or_default();

    let mut pairs: Vec<(&str, String)> = vec![
        ("e", "Access".to_string()),
        ("y", "Guest".to_string()),
        ("t", friendly_name),
        ("c", company),
        ("c", site),
    ];
    pairs.extend(std::iter::repeat(("c", String::new())).take(CUSTOM_PROPERTY_SLOTS - 2));

    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect();

    let raw = format!(
        "https://{}/Bin/{}?{}",
        config.agent.server_domain.trim(),
        INSTALLER_FILE,
        query.join("&")
    );
    Url::parse(&raw).with_context(|| format!("invalid installer URL {}", raw))
}

pub struct InstallerClient {
    client: reqwest::Client,
    sha256: Option<String>,
}

impl InstallerClient {
    pub fn with_checksum(sha256: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            sha256: sha256.map(|s| s.trim().to_lowercase()),
        }
    }

    /// Fetches the package into `dir` and returns the written path.
    pub async fn download(&self, url: &Url, dir: &Path) -> Result<PathBuf> {
        info!("Downloading installer from {}", url);
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        if bytes.is_empty() {
            return Err(anyhow::anyhow!("Installer download from {} was empty", url));
        }

        if let Some(expected) = &self.sha256 {
            let actual = sha256::digest(&*bytes);
            if &actual != expected {
                return Err(anyhow::anyhow!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    INSTALLER_FILE,
                    expected,
                    actual
                ));
            }
        }

        tokio::fs::create_dir_all(dir).await?;
        let target_path = dir.join(INSTALLER_FILE);
        tokio::fs::write(&target_path, &bytes).await?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), target_path);

        Ok(target_path)
    }
}

/// Downloads the MSI and runs `msiexec` quietly.
pub struct MsiInstaller {
    client: InstallerClient,
    url: Url,
    download_dir: PathBuf,
}

impl MsiInstaller {
    pub fn new(client: InstallerClient, url: Url, download_dir: PathBuf) -> Self {
        Self {
            client,
            url,
            download_dir,
        }
    }

    pub fn from_config(config: &KeeperConfig, host: &HostContext) -> Result<Self> {
        Ok(Self::new(
            InstallerClient::with_checksum(config.installer.sha256.clone()),
            installer_url(config, host)?,
            config.download_dir(),
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl PackageInstaller for MsiInstaller {
    async fn install(&self) -> Result<()> {
        let package = self.client.download(&self.url, &self.download_dir).await?;
        let package_arg = package.display().to_string();

        info!("Running msiexec /i {}", package_arg);
        let result = execute_msiexec(&["/i", &package_arg, "/qn", "/norestart"], &[]);

        if let Err(e) = tokio::fs::remove_file(&package).await {
            warn!("Could not remove {:?}: {}", package, e);
        }

        result
    }

    async fn uninstall(&self, product_code: &str) -> Result<()> {
        info!("Running msiexec /x {}", product_code);
        execute_msiexec(&["/x", product_code, "/qn", "/norestart"], &[MSI_UNKNOWN_PRODUCT])
    }

    async fn purge_files(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await? {
            info!("Removing {:?}", dir);
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }
}

fn execute_msiexec(args: &[&str], tolerated: &[i32]) -> Result<()> {
    let status = Command::new("msiexec.exe").args(args).status()?;

    match status.code() {
        Some(0) | Some(MSI_SUCCESS_REBOOT_INITIATED) | Some(MSI_SUCCESS_REBOOT_REQUIRED) => Ok(()),
        Some(code) if tolerated.contains(&code) => Ok(()),
        code => Err(anyhow::anyhow!(
            "msiexec {} failed with exit code {:?}",
            args.first().unwrap_or(&""),
            code
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_protocol::RmmPlatform;
    use tempfile::TempDir;

    fn config() -> KeeperConfig {
        let mut config = KeeperConfig::default();
        config.agent.service_name = "ScreenConnect Client (0a1b2c3d4e5f6789)".to_string();
        config.agent.server_domain = "support.example.com".to_string();
        config
    }

    fn host() -> HostContext {
        HostContext {
            platform: RmmPlatform::Datto,
            computer_name: Some("FRONT-DESK 01".to_string()),
            profile_name: Some("Acme & Sons".to_string()),
        }
    }

    #[test]
    fn test_installer_url_encodes_tokens() {
        let url = installer_url(&config(), &host()).unwrap();
        assert_eq!(url.host_str(), Some("support.example.com"));
        assert_eq!(url.path(), "/Bin/ScreenConnect.ClientSetup.msi");

        let query = url.query().unwrap();
        assert!(query.starts_with("e=Access&y=Guest&t=FRONT-DESK%2001&c=Acme%20%26%20Sons&c="));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let companies: Vec<&str> = pairs
            .iter()
            .filter(|(k, _)| k == "c")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(companies.len(), 8);
        assert_eq!(companies[0], "Acme & Sons");
        assert!(companies[1..].iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_installer_url_prefers_configured_values() {
        let mut config = config();
        config.installer.company = Some("Globex".to_string());
        config.installer.site = Some("HQ".to_string());
        config.installer.friendly_name = Some("kiosk".to_string());

        let url = installer_url(&config, &host()).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("t".to_string(), "kiosk".to_string())));
        assert_eq!(pairs[3], ("c".to_string(), "Globex".to_string()));
        assert_eq!(pairs[4], ("c".to_string(), "HQ".to_string()));
    }

    #[test]
    fn test_installer_url_without_host_details() {
        let bare = HostContext {
            platform: RmmPlatform::Standalone,
            computer_name: None,
            profile_name: None,
        };
        let url = installer_url(&config(), &bare).unwrap();
        assert!(url.query().unwrap().contains("t=&c=&c="));
    }

    #[tokio::test]
    async fn test_purge_missing_dir_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let installer = MsiInstaller::from_config(&config(), &host()).unwrap();
        installer
            .purge_files(&temp_dir.path().join("not-there"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_tree() {
        let temp_dir = TempDir::new().unwrap();
        let install_dir = temp_dir.path().join("ScreenConnect Client (0a1b2c3d4e5f6789)");
        tokio::fs::create_dir_all(install_dir.join("Bin")).await.unwrap();
        tokio::fs::write(install_dir.join("Bin").join("app.config"), "x")
            .await
            .unwrap();

        let installer = MsiInstaller::from_config(&config(), &host()).unwrap();
        installer.purge_files(&install_dir).await.unwrap();
        assert!(!install_dir.exists());
    }
}
