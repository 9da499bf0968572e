use anyhow::Result;
use keeper_protocol::{RmmPlatform, RunReport};
use std::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{datto_field_number, PlatformChoice, RmmConfig};
use crate::reg;

const DATTO_PROFILE_VAR: &str = "CS_PROFILE_NAME";
const DATTO_HOST_VAR: &str = "CS_CC_HOST";
const SYNCRO_MODULE_VAR: &str = "SyncroModule";
const DATTO_UDF_KEY: &str = r"HKLM\SOFTWARE\CentraStage";

/// Facts about the host gathered once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct HostContext {
    pub platform: RmmPlatform,
    pub computer_name: Option<String>,
    /// RMM site/profile name, used as the company when none is configured.
    pub profile_name: Option<String>,
}

impl HostContext {
    pub fn detect(choice: PlatformChoice) -> Self {
        Self::detect_with(choice, |key| std::env::var(key).ok())
    }

    pub fn detect_with<F>(choice: PlatformChoice, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let platform = match choice {
            PlatformChoice::Datto => RmmPlatform::Datto,
            PlatformChoice::Syncro => RmmPlatform::Syncro,
            PlatformChoice::Standalone => RmmPlatform::Standalone,
            PlatformChoice::Auto => {
                if var(DATTO_PROFILE_VAR).is_some() || var(DATTO_HOST_VAR).is_some() {
                    RmmPlatform::Datto
                } else if var(SYNCRO_MODULE_VAR).is_some() {
                    RmmPlatform::Syncro
                } else {
                    RmmPlatform::Standalone
                }
            }
        };

        Self {
            platform,
            computer_name: var("COMPUTERNAME"),
            profile_name: var(DATTO_PROFILE_VAR),
        }
    }
}

/// Host-side join link for the agent's session.
pub fn join_url(domain: &str, session_group: &str, guid: &str) -> String {
    format!(
        "https://{}/Host#Access/{}//{}/Join",
        domain.trim(),
        urlencoding::encode(session_group),
        guid
    )
}

/// Where run results and the join URL end up.
pub trait RmmReporter {
    fn report(&self, report: &RunReport) -> Result<()>;

    fn publish_field(&self, field: &str, value: &str) -> Result<()>;
}

pub fn reporter_for(platform: RmmPlatform, alert_category: &str) -> Box<dyn RmmReporter> {
    match platform {
        RmmPlatform::Datto => Box::new(DattoReporter),
        RmmPlatform::Syncro => Box::new(SyncroReporter::new(alert_category)),
        RmmPlatform::Standalone => Box::new(StandaloneReporter),
    }
}

/// Reports the run, then writes the join URL when a field is configured.
///
/// Reporting and field write failures are logged; the exit code follows
/// the run outcome alone.
pub fn deliver(reporter: &dyn RmmReporter, report: &RunReport, config: &RmmConfig) {
    if let Err(e) = reporter.report(report) {
        error!("Could not report result to {}: {:#}", report.platform, e);
    }

    if !config.publish_url {
        return;
    }

    match (&config.url_field, &report.join_url) {
        (Some(field), Some(url)) => {
            if let Err(e) = reporter.publish_field(field, url) {
                warn!("Could not write join URL to '{}': {:#}", field, e);
            }
        }
        (None, Some(_)) => debug!("No url_field configured, join URL not published"),
        (_, None) => debug!("No join URL to publish"),
    }
}

fn status_word(report: &RunReport) -> &'static str {
    if report.is_failure() {
        "ERROR"
    } else {
        "OK"
    }
}

fn diagnostic_lines(report: &RunReport) -> Vec<String> {
    let mut lines = vec![
        format!("Service: {}", report.service_name),
        format!("Status: {}", report.status),
    ];

    if let Some(program) = &report.installed {
        if let Some(version) = &program.version {
            lines.push(format!("Version: {}", version));
        }
        if let Some(date) = program.install_date {
            lines.push(format!("Installed: {}", date));
        }
    }

    if !report.steps_taken.is_empty() {
        let steps: Vec<String> = report.steps_taken.iter().map(|s| s.to_string()).collect();
        lines.push(format!("Steps: {}", steps.join(", ")));
    }

    if let Some(url) = &report.join_url {
        lines.push(format!("Join URL: {}", url));
    }

    lines
}

/// Datto RMM: result markers on stdout, fields as CentraStage UDF values.
pub struct DattoReporter;

impl DattoReporter {
    pub fn render(report: &RunReport) -> String {
        let mut out = String::new();
        out.push_str("<-Start Result->\n");
        out.push_str(&format!(
            "Status={}: {}\n",
            status_word(report),
            report.outcome.summary()
        ));
        out.push_str("<-End Result->\n");
        out.push_str("<-Start Diagnostic->\n");
        for line in diagnostic_lines(report) {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str("<-End Diagnostic->\n");
        out
    }
}

impl RmmReporter for DattoReporter {
    fn report(&self, report: &RunReport) -> Result<()> {
        print!("{}", Self::render(report));
        Ok(())
    }

    fn publish_field(&self, field: &str, value: &str) -> Result<()> {
        let slot = datto_field_number(field)?;
        reg::write_string_value(DATTO_UDF_KEY, &format!("Custom{}", slot), value)?;
        info!("Wrote join URL to Datto {}", field);
        Ok(())
    }
}

/// Syncro: alerts and asset fields through the Syncro PowerShell module.
pub struct SyncroReporter {
    category: String,
}

impl SyncroReporter {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }

    pub fn alert_script(&self, report: &RunReport) -> String {
        let command = if report.is_failure() {
            format!(
                "Rmm-Alert -Category {} -Body {}",
                ps_quote(&self.category),
                ps_quote(&report.outcome.summary())
            )
        } else {
            format!("Close-Rmm-Alert -Category {}", ps_quote(&self.category))
        };
        with_module(&command)
    }

    pub fn field_script(field: &str, value: &str) -> String {
        with_module(&format!(
            "Set-Asset-Field -Name {} -Value {}",
            ps_quote(field),
            ps_quote(value)
        ))
    }
}

impl RmmReporter for SyncroReporter {
    fn report(&self, report: &RunReport) -> Result<()> {
        println!("{}: {}", status_word(report), report.outcome.summary());
        for line in diagnostic_lines(report) {
            println!("{}", line);
        }
        execute_powershell(&self.alert_script(report))
    }

    fn publish_field(&self, field: &str, value: &str) -> Result<()> {
        execute_powershell(&Self::field_script(field, value))?;
        info!("Wrote join URL to Syncro field '{}'", field);
        Ok(())
    }
}

/// No RMM detected: plain console output.
pub struct StandaloneReporter;

impl RmmReporter for StandaloneReporter {
    fn report(&self, report: &RunReport) -> Result<()> {
        println!("{}: {}", status_word(report), report.outcome.summary());
        for line in diagnostic_lines(report) {
            println!("  {}", line);
        }
        Ok(())
    }

    fn publish_field(&self, field: &str, _value: &str) -> Result<()> {
        warn!("No RMM platform detected, not writing field '{}'", field);
        Ok(())
    }
}

fn with_module(command: &str) -> String {
    format!(
        "Import-Module $env:{} -WarningAction SilentlyContinue; {}",
        SYNCRO_MODULE_VAR, command
    )
}

/// Single-quoted PowerShell literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn execute_powershell(script: &str) -> Result<()> {
    debug!("powershell: {}", script);
    let output = Command::new("powershell.exe")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ])
        .output()?;

    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "powershell failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use keeper_protocol::{InstalledProgram, Outcome, RepairStep, ServiceStatus};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn report(outcome: Outcome) -> RunReport {
        RunReport {
            service_name: "ScreenConnect Client (0a1b2c3d4e5f6789)".to_string(),
            platform: RmmPlatform::Datto,
            status: ServiceStatus::Running,
            installed: Some(InstalledProgram {
                display_name: "ScreenConnect Client (0a1b2c3d4e5f6789)".to_string(),
                version: Some("23.9.8.8811".parse().unwrap()),
                install_date: NaiveDate::from_ymd_opt(2024, 1, 15),
                product_code: None,
            }),
            outcome,
            steps_taken: vec![RepairStep::Restart],
            join_url: Some("https://support.example.com/Host#Access/All%20Machines//x/Join".into()),
        }
    }

    #[test]
    fn test_detect_datto() {
        let host = HostContext::detect_with(
            PlatformChoice::Auto,
            lookup(&[("CS_PROFILE_NAME", "Acme"), ("COMPUTERNAME", "PC-1")]),
        );
        assert_eq!(host.platform, RmmPlatform::Datto);
        assert_eq!(host.profile_name.as_deref(), Some("Acme"));
        assert_eq!(host.computer_name.as_deref(), Some("PC-1"));
    }

    #[test]
    fn test_detect_syncro() {
        let host = HostContext::detect_with(
            PlatformChoice::Auto,
            lookup(&[("SyncroModule", r"C:\ProgramData\Syncro\bin\module.psm1")]),
        );
        assert_eq!(host.platform, RmmPlatform::Syncro);
        assert_eq!(host.profile_name, None);
    }

    #[test]
    fn test_detect_ignores_blank_vars() {
        let host = HostContext::detect_with(PlatformChoice::Auto, lookup(&[("CS_CC_HOST", "  ")]));
        assert_eq!(host.platform, RmmPlatform::Standalone);
    }

    #[test]
    fn test_explicit_choice_wins() {
        let host = HostContext::detect_with(
            PlatformChoice::Syncro,
            lookup(&[("CS_PROFILE_NAME", "Acme")]),
        );
        assert_eq!(host.platform, RmmPlatform::Syncro);

        let host = HostContext::detect_with(PlatformChoice::Standalone, lookup(&[("SyncroModule", "m")]));
        assert_eq!(host.platform, RmmPlatform::Standalone);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url(
                "support.example.com",
                "All Machines",
                "5d0c1b1e-2f3a-4b5c-8d9e-0f1a2b3c4d5e"
            ),
            "https://support.example.com/Host#Access/All%20Machines//5d0c1b1e-2f3a-4b5c-8d9e-0f1a2b3c4d5e/Join"
        );
    }

    #[test]
    fn test_datto_render_success() {
        let out = DattoReporter::render(&report(Outcome::Repaired {
            step: RepairStep::Restart,
        }));
        assert!(out.starts_with("<-Start Result->\nStatus=OK: agent repaired by restart\n<-End Result->\n"));
        assert!(out.contains("Version: 23.9.8.8811\n"));
        assert!(out.contains("Installed: 2024-01-15\n"));
        assert!(out.contains("Steps: restart\n"));
        assert!(out.ends_with("<-End Diagnostic->\n"));
    }

    #[test]
    fn test_datto_render_failure() {
        let out = DattoReporter::render(&report(Outcome::ServiceDown));
        assert!(out.contains("Status=ERROR: agent service is not running"));
    }

    #[test]
    fn test_syncro_scripts() {
        let reporter = SyncroReporter::new("ScreenConnect");
        let failed = reporter.alert_script(&report(Outcome::ServiceDown));
        assert!(failed.starts_with("Import-Module $env:SyncroModule"));
        assert!(failed.contains("Rmm-Alert -Category 'ScreenConnect' -Body 'agent service"));

        let ok = reporter.alert_script(&report(Outcome::Healthy));
        assert!(ok.ends_with("Close-Rmm-Alert -Category 'ScreenConnect'"));

        let field = SyncroReporter::field_script("ScreenConnect URL", "https://x/Join");
        assert!(field.ends_with("Set-Asset-Field -Name 'ScreenConnect URL' -Value 'https://x/Join'"));
    }

    #[test]
    fn test_ps_quote_escapes() {
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_datto_rejects_bad_field() {
        assert!(DattoReporter.publish_field("Custom99", "x").is_err());
    }
}
