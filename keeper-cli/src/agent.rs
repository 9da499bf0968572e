use anyhow::Result;
use keeper_common::rmm::reporter_for;
use keeper_common::{
    KeeperConfig, PackageInstaller, ProgramInventory, RegInventory, ScServiceControl, ServiceControl,
};
use std::process::ExitCode;
use tracing::{error, info};

use crate::system;

pub fn status_agent(config: &KeeperConfig, json: bool) -> Result<()> {
    let name = &config.agent.service_name;
    let status = ScServiceControl::new().query(name)?;
    let installed = RegInventory::new().find_program(name)?;

    let host = system::detect_host(config)?;
    let join_url = system::live_maintainer(config, &host)?.join_url();

    if json {
        let value = serde_json::json!({
            "service_name": name,
            "platform": host.platform,
            "status": status,
            "installed": installed,
            "join_url": join_url,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("🔌 {}", name);
    println!("   Status: {}", status);
    match &installed {
        Some(program) => {
            if let Some(version) = &program.version {
                println!("   Version: {}", version);
            }
            if let Some(date) = program.install_date {
                println!("   Installed: {}", date);
            }
            if let Some(code) = &program.product_code {
                println!("   Product code: {}", code);
            }
        }
        None => println!("   Not found in installed programs"),
    }
    if let Some(url) = join_url {
        println!("   Join URL: {}", url);
    }

    Ok(())
}

pub async fn install_agent(config: &KeeperConfig) -> Result<ExitCode> {
    let host = system::detect_host(config)?;
    let maintainer = system::live_maintainer(config, &host)?;
    let installer = maintainer.installer();

    info!("Installing '{}' from {}", config.agent.service_name, installer.url());
    installer.install().await?;

    let status = ScServiceControl::new().query(&config.agent.service_name)?;
    println!("Installed service: {} ({})", config.agent.service_name, status);

    if let Some(url) = maintainer.join_url() {
        println!("Join URL: {}", url);
    }

    if status.is_running() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Service is {} after install", status);
        Ok(ExitCode::FAILURE)
    }
}

pub async fn remove_agent(config: &KeeperConfig) -> Result<ExitCode> {
    let host = system::detect_host(config)?;
    system::live_maintainer(config, &host)?.force_remove().await;

    let status = ScServiceControl::new().query(&config.agent.service_name)?;
    if status.exists() {
        error!("Service '{}' still present ({})", config.agent.service_name, status);
        Ok(ExitCode::FAILURE)
    } else {
        println!("Removed service: {}", config.agent.service_name);
        Ok(ExitCode::SUCCESS)
    }
}

pub fn print_join_url(config: &KeeperConfig, publish: bool) -> Result<()> {
    let host = system::detect_host(config)?;
    let url = system::live_maintainer(config, &host)?
        .join_url()
        .ok_or_else(|| anyhow::anyhow!("No session GUID found for '{}'", config.agent.service_name))?;

    println!("{}", url);

    if publish {
        let field = config
            .rmm
            .url_field
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--publish needs url_field to be configured"))?;
        reporter_for(host.platform, &config.rmm.alert_category).publish_field(field, &url)?;
    }

    Ok(())
}
