use anyhow::Result;
use chrono::NaiveDate;
use keeper_protocol::{AgentVersion, InstalledProgram};
use std::collections::HashMap;
use std::process::Command;
use tracing::{debug, warn};

pub const UNINSTALL_KEYS: [&str; 2] = [
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
];

const SERVICES_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Services";

/// Registry lookups the maintenance pass needs.
pub trait ProgramInventory {
    /// Finds the uninstall entry whose `DisplayName` matches, case-insensitively.
    fn find_program(&self, display_name: &str) -> Result<Option<InstalledProgram>>;

    /// Session GUID embedded in the service image path.
    fn session_guid(&self, service_name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryKey {
    pub path: String,
    pub values: HashMap<String, String>,
}

impl RegistryKey {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn leaf(&self) -> &str {
        self.path.rsplit('\\').next().unwrap_or(&self.path)
    }
}

/// `reg.exe` backed inventory.
#[derive(Debug, Default, Clone)]
pub struct RegInventory;

impl RegInventory {
    pub fn new() -> Self {
        Self
    }
}

impl ProgramInventory for RegInventory {
    fn find_program(&self, display_name: &str) -> Result<Option<InstalledProgram>> {
        let mut matches = Vec::new();
        for root in UNINSTALL_KEYS {
            let keys = query_registry(&[root, "/s"])?;
            matches.extend(
                keys.iter()
                    .filter(|k| {
                        k.get("DisplayName")
                            .map(|n| n.eq_ignore_ascii_case(display_name))
                            .unwrap_or(false)
                    })
                    .map(program_from_key),
            );
        }
        Ok(newest_program(matches))
    }

    fn session_guid(&self, service_name: &str) -> Result<Option<String>> {
        let key = format!(r"{}\{}", SERVICES_KEY, service_name);
        let keys = query_registry(&[&key, "/v", "ImagePath"])?;
        Ok(keys
            .iter()
            .find_map(|k| k.get("ImagePath"))
            .and_then(guid_from_image_path))
    }
}

/// Runs `reg query`; a missing key yields no entries rather than an error.
pub fn query_registry(args: &[&str]) -> Result<Vec<RegistryKey>> {
    debug!("reg query {}", args.join(" "));
    let output = Command::new("reg.exe").arg("query").args(args).output()?;

    match output.status.code() {
        Some(0) => Ok(parse_reg_query(&String::from_utf8_lossy(&output.stdout))),
        Some(1) => Ok(Vec::new()),
        code => Err(anyhow::anyhow!(
            "reg query failed ({:?}): {}",
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
    }
}

pub fn write_string_value(key: &str, name: &str, value: &str) -> Result<()> {
    debug!("reg add {} /v {}", key, name);
    let output = Command::new("reg.exe")
        .args(["add", key, "/v", name, "/t", "REG_SZ", "/d", value, "/f"])
        .output()?;

    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "reg add {}\\{} failed: {}",
            key,
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Parses `reg query` output into keys with their values.
pub fn parse_reg_query(output: &str) -> Vec<RegistryKey> {
    let mut keys = Vec::new();
    let mut current: Option<RegistryKey> = None;

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with("End of search") {
            continue;
        }

        if line.starts_with("HKEY_") {
            if let Some(key) = current.take() {
                keys.push(key);
            }
            current = Some(RegistryKey {
                path: line.trim().to_string(),
                values: HashMap::new(),
            });
            continue;
        }

        let Some(key) = current.as_mut() else {
            continue;
        };

        let mut parts = line.trim_start().splitn(3, "    ");
        let (Some(name), Some(kind)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !kind.starts_with("REG_") {
            continue;
        }
        let data = parts.next().unwrap_or_default().trim();
        key.values.insert(name.to_string(), data.to_string());
    }

    if let Some(key) = current {
        keys.push(key);
    }

    keys
}

pub fn program_from_key(key: &RegistryKey) -> InstalledProgram {
    let version = key.get("DisplayVersion").and_then(|v| match v.parse::<AgentVersion>() {
        Ok(version) => Some(version),
        Err(e) => {
            warn!("Ignoring DisplayVersion in {}: {}", key.path, e);
            None
        }
    });

    let install_date = key
        .get("InstallDate")
        .and_then(|d| match NaiveDate::parse_from_str(d, "%Y%m%d") {
            Ok(date) => Some(date),
            Err(e) => {
                warn!("Ignoring InstallDate '{}' in {}: {}", d, key.path, e);
                None
            }
        });

    let leaf = key.leaf();
    let product_code = leaf
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|inner| is_guid(inner))
        .map(|_| leaf.to_string());

    InstalledProgram {
        display_name: key.get("DisplayName").unwrap_or_default().to_string(),
        version,
        install_date,
        product_code,
    }
}

/// Picks the highest version, then the latest install date.
pub fn newest_program(programs: Vec<InstalledProgram>) -> Option<InstalledProgram> {
    programs
        .into_iter()
        .max_by(|a, b| (&a.version, a.install_date).cmp(&(&b.version, b.install_date)))
}

/// Extracts the `s=` parameter from the client's quoted launch arguments.
pub fn guid_from_image_path(image_path: &str) -> Option<String> {
    image_path
        .split('"')
        .map(str::trim)
        .filter_map(|segment| segment.strip_prefix('?'))
        .flat_map(|query| url::form_urlencoded::parse(query.as_bytes()))
        .find(|(k, _)| k == "s")
        .map(|(_, v)| v.into_owned())
        .filter(|v| is_guid(v))
}

pub fn is_guid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}
