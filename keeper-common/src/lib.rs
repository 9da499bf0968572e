pub mod config;
pub mod installer;
pub mod maintainer;
pub mod reg;
pub mod rmm;
pub mod sc;


pub use config::KeeperConfig;
pub use installer::{InstallerClient, MsiInstaller, PackageInstaller};
pub use maintainer::Maintainer;
pub use reg::{ProgramInventory, RegInventory};
pub use rmm::{HostContext, RmmReporter};
pub use sc::{ScServiceControl, ServiceControl};
