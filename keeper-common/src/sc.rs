use anyhow::Result;
use keeper_protocol::ServiceStatus;
use std::process::Command;
use tracing::debug;

const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

/// Service control manager operations used by the repair ladder.
pub trait ServiceControl {
    fn query(&self, name: &str) -> Result<ServiceStatus>;

    /// Set the service to start automatically.
    fn enable(&self, name: &str) -> Result<()>;

    fn start(&self, name: &str) -> Result<()>;

    fn stop(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;
}

/// `sc.exe` backed service control.
#[derive(Debug, Default, Clone)]
pub struct ScServiceControl;

impl ScServiceControl {
    pub fn new() -> Self {
        Self
    }

    fn run_sc(&self, args: &[&str]) -> Result<(Option<i32>, String)> {
        debug!("sc {}", args.join(" "));
        let output = Command::new("sc.exe").args(args).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Ok((output.status.code(), stdout))
    }

    fn execute_sc(&self, args: &[&str], tolerated: &[i32]) -> Result<String> {
        let (code, stdout) = self.run_sc(args)?;

        match code {
            Some(0) => Ok(stdout),
            Some(code) if tolerated.contains(&code) => Ok(stdout),
            code => Err(sc_failure(args.first().unwrap_or(&""), code, &stdout)),
        }
    }
}

fn sc_failure(verb: &str, code: Option<i32>, stdout: &str) -> anyhow::Error {
    anyhow::anyhow!("sc {} failed ({:?}): {}", verb, code, stdout.trim())
}

impl ServiceControl for ScServiceControl {
    fn query(&self, name: &str) -> Result<ServiceStatus> {
        let (code, stdout) = self.run_sc(&["query", name])?;
        status_from_query(code, &stdout)
    }

    fn enable(&self, name: &str) -> Result<()> {
        self.execute_sc(&["config", name, "start=", "auto"], &[])?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.execute_sc(&["start", name], &[ERROR_SERVICE_ALREADY_RUNNING])?;
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.execute_sc(
            &["stop", name],
            &[ERROR_SERVICE_NOT_ACTIVE, ERROR_SERVICE_DOES_NOT_EXIST],
        )?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.execute_sc(&["delete", name], &[ERROR_SERVICE_DOES_NOT_EXIST])?;
        Ok(())
    }
}

/// Maps the exit code of `sc query` first, falling back to its text.
/// Message wording is localized; exit code 1060 is not.
pub fn status_from_query(code: Option<i32>, output: &str) -> Result<ServiceStatus> {
    match code {
        Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(ServiceStatus::NotFound),
        Some(0) => parse_sc_query(output),
        other => Err(sc_failure("query", other, output)),
    }
}

/// Reads the `STATE` line of `sc query` output.
pub fn parse_sc_query(output: &str) -> Result<ServiceStatus> {
    if output.contains(&format!(" {}:", ERROR_SERVICE_DOES_NOT_EXIST)) {
        return Ok(ServiceStatus::NotFound);
    }

    let state_line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("STATE"))
        .ok_or_else(|| anyhow::anyhow!("no STATE line in sc output: {}", output.trim()))?;

    let value = state_line
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .unwrap_or_default();
    let code = value
        .split_whitespace()
        .next()
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(|| anyhow::anyhow!("unreadable service state '{}'", value))?;

    match code {
        4 => Ok(ServiceStatus::Running),
        1 | 7 => Ok(ServiceStatus::Stopped),
        2 | 3 | 5 | 6 => Ok(ServiceStatus::Pending),
        other => Err(anyhow::anyhow!("unknown service state code {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = r#"
SERVICE_NAME: ScreenConnect Client (0a1b2c3d4e5f6789)
        TYPE               : 10  WIN32_OWN_PROCESS
        STATE              : 4  RUNNING
                                (STOPPABLE, NOT_PAUSABLE, ACCEPTS_SHUTDOWN)
        WIN32_EXIT_CODE    : 0  (0x0)
        SERVICE_EXIT_CODE  : 0  (0x0)
        CHECKPOINT         : 0x0
        WAIT_HINT          : 0x0
"#;

    const STOPPED: &str = r#"
SERVICE_NAME: ScreenConnect Client (0a1b2c3d4e5f6789)
        TYPE               : 10  WIN32_OWN_PROCESS
        STATE              : 1  STOPPED
        WIN32_EXIT_CODE    : 1077  (0x435)
"#;

    const MISSING: &str = "[SC] EnumQueryServicesStatus:OpenService FAILED 1060:\r\n\r\nThe specified service does not exist as an installed service.\r\n";

    #[test]
    fn test_parse_running() {
        assert_eq!(parse_sc_query(RUNNING).unwrap(), ServiceStatus::Running);
    }

    #[test]
    fn test_parse_stopped() {
        assert_eq!(parse_sc_query(STOPPED).unwrap(), ServiceStatus::Stopped);
    }

    #[test]
    fn test_parse_missing() {
        assert_eq!(parse_sc_query(MISSING).unwrap(), ServiceStatus::NotFound);
    }

    #[test]
    fn test_missing_service_by_exit_code() {
        let localized = "[SC] EnumQueryServicesStatus:OpenService FEHLER 1060:\r\n\r\nDer angegebene Dienst ist kein installierter Dienst.\r\n";
        assert_eq!(
            status_from_query(Some(1060), localized).unwrap(),
            ServiceStatus::NotFound
        );
        assert_eq!(parse_sc_query(localized).unwrap(), ServiceStatus::NotFound);
    }

    #[test]
    fn test_query_exit_codes() {
        assert_eq!(
            status_from_query(Some(0), RUNNING).unwrap(),
            ServiceStatus::Running
        );
        let err = status_from_query(Some(5), "Access is denied.").unwrap_err();
        assert!(err.to_string().contains("Access is denied."));
        assert!(status_from_query(None, "").is_err());
    }

    #[test]
    fn test_parse_pending() {
        let output = "        STATE              : 2  START_PENDING\n";
        assert_eq!(parse_sc_query(output).unwrap(), ServiceStatus::Pending);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_sc_query("Access is denied.").is_err());
        assert!(parse_sc_query("        STATE              : x  RUNNING").is_err());
    }
}
