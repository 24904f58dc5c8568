//! `askdb init`: write a default config file.

use std::path::{Path, PathBuf};

use askdb_config::AppConfig;

use super::CliResult;

pub fn run(path: Option<&Path>, force: bool) -> CliResult {
    let target = target_path(path);
    if write_default(&target, force)? {
        println!("Created {}", target.display());
        println!("Next steps:");
        println!("  1. Set the database section and reasoner.api_key (or OPENAI_API_KEY)");
        println!("  2. Set gateway.internal_api_key (or INTERNAL_API_KEY)");
        println!("  3. Run: askdb doctor");
    } else {
        println!("Config already exists at {}", target.display());
        println!("Edit it manually or re-run with --force.");
    }
    Ok(())
}

fn target_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Returns `false` when the file exists and `force` is not set.
fn write_default(target: &Path, force: bool) -> CliResult<bool> {
    if target.exists() && !force {
        return Ok(false);
    }
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(target, AppConfig::default_toml())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert!(write_default(&path, false).unwrap());
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 8000);
    }

    #[test]
    fn keeps_existing_file_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# mine\n").unwrap();

        assert!(!write_default(&path, false).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");

        assert!(write_default(&path, true).unwrap());
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "# mine\n");
    }
}
