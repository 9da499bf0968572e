use anyhow::Result;
use keeper_common::rmm::{deliver, reporter_for};
use keeper_common::KeeperConfig;
use std::process::ExitCode;
use tracing::{error, info};

use crate::system;

pub async fn handle_check_command(config: &KeeperConfig, json: bool) -> Result<ExitCode> {
    let host = system::detect_host(config)?;
    let maintainer = system::live_maintainer(config, &host)?;

    let report = maintainer.run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let reporter = reporter_for(host.platform, &config.rmm.alert_category);
        deliver(reporter.as_ref(), &report, &config.rmm);
    }

    if report.is_failure() {
        error!("{}", report.outcome.summary());
        Ok(ExitCode::FAILURE)
    } else {
        info!("{}", report.outcome.summary());
        Ok(ExitCode::SUCCESS)
    }
}
