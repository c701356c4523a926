use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "edu";
pub const APP_ORG: &str = "institute";
pub const APP_NAME: &str = "portal";

pub const DATA_DIR_ENV: &str = "PORTAL_DATA_DIR";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("portal.json")
}
