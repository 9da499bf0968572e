use anyhow::Result;
use keeper_common::{
    HostContext, KeeperConfig, Maintainer, MsiInstaller, RegInventory, ScServiceControl,
};
use tracing::info;

use crate::{Args, DEFAULT_CONFIG_PATH};

pub type LiveMaintainer<'a> = Maintainer<'a, ScServiceControl, RegInventory, MsiInstaller>;

pub async fn load_config(args: &Args) -> Result<KeeperConfig> {
    let mut config = match &args.config {
        Some(path) => KeeperConfig::load(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load config file {:?}: {}", path, e))?,
        None => KeeperConfig::load_or_default(DEFAULT_CONFIG_PATH).await?,
    };

    apply_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut KeeperConfig, args: &Args) {
    if let Some(name) = &args.service_name {
        config.agent.service_name = name.clone();
    }
    if let Some(domain) = &args.domain {
        config.agent.server_domain = domain.clone();
    }
    if let Some(company) = &args.company {
        config.installer.company = Some(company.clone());
    }
    if let Some(site) = &args.site {
        config.installer.site = Some(site.clone());
    }
    if let Some(field) = &args.url_field {
        config.rmm.url_field = Some(field.clone());
    }
    if args.no_url {
        config.rmm.publish_url = false;
    }
    if let Some(platform) = args.platform {
        config.rmm.platform = platform;
    }
    if let Some(seconds) = args.settle_seconds {
        config.run.settle_seconds = seconds;
    }
}

pub fn detect_host(config: &KeeperConfig) -> Result<HostContext> {
    checked_host(config, HostContext::detect(config.rmm.platform))
}

fn checked_host(config: &KeeperConfig, host: HostContext) -> Result<HostContext> {
    info!("RMM platform: {}", host.platform);
    config.validate_for(host.platform)?;
    Ok(host)
}

pub fn live_maintainer<'a>(config: &'a KeeperConfig, host: &HostContext) -> Result<LiveMaintainer<'a>> {
    Ok(Maintainer::new(
        config,
        host.platform,
        ScServiceControl::new(),
        RegInventory::new(),
        MsiInstaller::from_config(config, host)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use keeper_common::config::PlatformChoice;

    #[test]
    fn test_flags_override_file_values() {
        let args = Args::parse_from([
            "sc-keeper",
            "--service-name",
            "ScreenConnect Client (feedface00000000)",
            "--domain",
            "help.example.org",
            "--url-field",
            "Custom4",
            "--no-url",
            "--platform",
            "datto",
            "--settle-seconds",
            "0",
            "check",
        ]);

        let mut config = KeeperConfig::default();
        config.agent.server_domain = "old.example.org".to_string();
        apply_overrides(&mut config, &args);

        assert_eq!(config.agent.service_name, "ScreenConnect Client (feedface00000000)");
        assert_eq!(config.agent.server_domain, "help.example.org");
        assert_eq!(config.rmm.url_field.as_deref(), Some("Custom4"));
        assert!(!config.rmm.publish_url);
        assert_eq!(config.rmm.platform, PlatformChoice::Datto);
        assert_eq!(config.run.settle_seconds, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_auto_detected_datto_rejects_bad_field() {
        let args = Args::parse_from([
            "sc-keeper",
            "--service-name",
            "ScreenConnect Client (feedface00000000)",
            "--domain",
            "help.example.org",
            "--url-field",
            "Custom99",
            "check",
        ]);
        let mut config = KeeperConfig::default();
        apply_overrides(&mut config, &args);
        config.validate().unwrap();

        let datto = HostContext::detect_with(PlatformChoice::Auto, |key: &str| {
            (key == "CS_PROFILE_NAME").then(|| "Acme".to_string())
        });
        assert!(checked_host(&config, datto).is_err());

        let syncro = HostContext::detect_with(PlatformChoice::Auto, |key: &str| {
            (key == "SyncroModule").then(|| "module.psm1".to_string())
        });
        assert!(checked_host(&config, syncro).is_ok());
    }

    #[test]
    fn test_absent_flags_keep_file_values() {
        let args = Args::parse_from(["sc-keeper", "status"]);

        let mut config = KeeperConfig::default();
        config.installer.company = Some("Acme".to_string());
        apply_overrides(&mut config, &args);

        assert_eq!(config.installer.company.as_deref(), Some("Acme"));
        assert!(config.rmm.publish_url);
        assert_eq!(config.run.settle_seconds, 10);
    }
}
