use chrono::NaiveDate;
use keeper_protocol::{
    InstalledProgram, Outcome, RepairStep, RmmPlatform, RunReport, ServiceStatus, Staleness,
};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{KeeperConfig, StalenessConfig};
use crate::installer::PackageInstaller;
use crate::reg::ProgramInventory;
use crate::rmm::join_url;
use crate::sc::ServiceControl;

/// Runs one check-and-repair pass over the agent service.
pub struct Maintainer<'a, S, P, I> {
    config: &'a KeeperConfig,
    platform: RmmPlatform,
    services: S,
    inventory: P,
    installer: I,
    settle: Duration,
    today: NaiveDate,
}

impl<'a, S, P, I> Maintainer<'a, S, P, I>
where
    S: ServiceControl,
    P: ProgramInventory,
    I: PackageInstaller,
{
    pub fn new(
        config: &'a KeeperConfig,
        platform: RmmPlatform,
        services: S,
        inventory: P,
        installer: I,
    ) -> Self {
        Self {
            config,
            platform,
            services,
            inventory,
            installer,
            settle: Duration::from_secs(config.run.settle_seconds),
            today: chrono::Local::now().date_naive(),
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    fn service_name(&self) -> &str {
        &self.config.agent.service_name
    }

    /// Query failures read as `Unknown` so the pass always ends in a report.
    fn query_status(&self) -> ServiceStatus {
        match self.services.query(self.service_name()) {
            Ok(status) => status,
            Err(e) => {
                error!("Service query for '{}' failed: {:#}", self.service_name(), e);
                ServiceStatus::Unknown
            }
        }
    }

    pub async fn run(&self) -> RunReport {
        let name = self.service_name();
        let mut steps_taken = Vec::new();

        let mut status = self.query_status();
        info!("Service '{}' is {}", name, status);

        let mut repaired = None;
        if !status.is_running() {
            let first = if status.exists() {
                RepairStep::Restart
            } else {
                RepairStep::Reinstall
            };

            match self.climb(first, &mut steps_taken).await {
                Some(step) => {
                    repaired = Some(step);
                    status = ServiceStatus::Running;
                }
                None => {
                    error!("Service '{}' could not be brought up", name);
                    let installed = self.lookup_program();
                    return self.report(
                        self.query_status(),
                        installed,
                        Outcome::ServiceDown,
                        steps_taken,
                    );
                }
            }
        }

        let mut installed = self.lookup_program();
        let outcome = match staleness(installed.as_ref(), self.today, &self.config.staleness) {
            None => match repaired {
                Some(step) => Outcome::Repaired { step },
                None => Outcome::Healthy,
            },
            Some(reason) => {
                warn!("Agent is out of date: {}", reason);
                let (outcome, after, current) = self.update(reason, &mut steps_taken).await;
                status = after;
                installed = current;
                outcome
            }
        };

        self.report(status, installed, outcome, steps_taken)
    }

    /// Walks the ladder from `first` until the service reports running.
    async fn climb(
        &self,
        first: RepairStep,
        steps_taken: &mut Vec<RepairStep>,
    ) -> Option<RepairStep> {
        let name = self.service_name();
        let mut next = Some(first);

        while let Some(step) = next {
            steps_taken.push(step);
            self.apply(step).await;

            let status = self.query_status();
            if status.is_running() {
                info!("Service '{}' running after {}", name, step);
                return Some(step);
            }

            warn!("Service '{}' still {} after {}", name, status, step);
            next = step.next();
        }

        None
    }

    async fn update(
        &self,
        mut reason: Staleness,
        steps_taken: &mut Vec<RepairStep>,
    ) -> (Outcome, ServiceStatus, Option<InstalledProgram>) {
        let name = self.service_name();
        let mut status = ServiceStatus::Running;
        let mut installed = None;

        for step in [RepairStep::Reinstall, RepairStep::ForceReinstall] {
            steps_taken.push(step);
            self.apply(step).await;

            status = self.query_status();
            installed = self.lookup_program();

            if !status.is_running() {
                warn!("Service '{}' is {} after {}", name, status, step);
                continue;
            }

            match staleness(installed.as_ref(), self.today, &self.config.staleness) {
                None => {
                    info!("Agent up to date after {}", step);
                    return (Outcome::Updated { step }, status, installed);
                }
                Some(still) => {
                    warn!("Agent still out of date after {}: {}", step, still);
                    reason = still;
                }
            }
        }

        let outcome = if status.is_running() {
            Outcome::StillStale { reason }
        } else {
            Outcome::ServiceDown
        };
        (outcome, status, installed)
    }

    /// Runs a single rung. Failures are logged; the status check that
    /// follows decides whether to escalate.
    async fn apply(&self, step: RepairStep) {
        let name = self.service_name();
        info!("Attempting {} of '{}'", step, name);

        let result = match step {
            RepairStep::Restart => self
                .services
                .enable(name)
                .and_then(|_| self.services.start(name)),
            RepairStep::Reinstall => self.installer.install().await,
            RepairStep::ForceReinstall => {
                self.force_remove().await;
                self.installer.install().await
            }
        };

        if let Err(e) = result {
            error!("{} of '{}' failed: {:#}", step, name, e);
        }

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }

    /// Stops, uninstalls, deletes and purges the agent, best effort.
    pub async fn force_remove(&self) {
        let name = self.service_name();
        info!("Force removing '{}'", name);

        if let Err(e) = self.services.stop(name) {
            warn!("Stop failed: {:#}", e);
        }

        if let Some(code) = self
            .lookup_program()
            .and_then(|program| program.product_code)
        {
            if let Err(e) = self.installer.uninstall(&code).await {
                warn!("Uninstall of {} failed: {:#}", code, e);
            }
        }

        if let Err(e) = self.services.delete(name) {
            warn!("Service delete failed: {:#}", e);
        }

        match self.config.install_dir() {
            Ok(dir) => {
                if let Err(e) = self.installer.purge_files(&dir).await {
                    warn!("Removing {:?} failed: {:#}", dir, e);
                }
            }
            Err(e) => warn!("No install directory to purge: {:#}", e),
        }
    }

    fn lookup_program(&self) -> Option<InstalledProgram> {
        match self.inventory.find_program(self.service_name()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Installed program lookup failed: {:#}", e);
                None
            }
        }
    }

    pub fn join_url(&self) -> Option<String> {
        match self.inventory.session_guid(self.service_name()) {
            Ok(Some(guid)) => Some(join_url(
                &self.config.agent.server_domain,
                &self.config.installer.session_group,
                &guid,
            )),
            Ok(None) => {
                warn!("No session GUID in service image path");
                None
            }
            Err(e) => {
                warn!("Session GUID lookup failed: {:#}", e);
                None
            }
        }
    }

    fn report(
        &self,
        status: ServiceStatus,
        installed: Option<InstalledProgram>,
        outcome: Outcome,
        steps_taken: Vec<RepairStep>,
    ) -> RunReport {
        let join_url = if status.exists() { self.join_url() } else { None };
        RunReport {
            service_name: self.service_name().to_string(),
            platform: self.platform,
            status,
            installed,
            outcome,
            steps_taken,
            join_url,
        }
    }
}

/// Decides whether an installed agent needs updating.
///
/// Unknown install date or version skip their respective check.
pub fn staleness(
    program: Option<&InstalledProgram>,
    today: NaiveDate,
    limits: &StalenessConfig,
) -> Option<Staleness> {
    let Some(program) = program else {
        warn!("No installed program entry, skipping staleness check");
        return None;
    };

    match program.install_date {
        Some(installed) => {
            let age_days = (today - installed).num_days();
            if age_days > limits.max_install_age_days {
                return Some(Staleness::TooOld {
                    installed,
                    age_days,
                });
            }
        }
        None => warn!("Install date unknown, skipping age check"),
    }

    if let Some(floor) = &limits.min_version {
        match &program.version {
            Some(installed) if installed < floor => {
                return Some(Staleness::BelowFloor {
                    installed: installed.clone(),
                    floor: floor.clone(),
                });
            }
            Some(_) => {}
            None => warn!("Installed version unknown, skipping version check"),
        }
    }

    None
}
