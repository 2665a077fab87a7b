//! Configuration loading from `~/.devlink/config.toml` with defaults.
//!
//! A config may list other TOML files under `include`. They are merged in
//! order beneath the file that names them, so the including file wins.

use devlink_types::config::DevlinkConfig;
use devlink_types::{DevlinkError, DevlinkResult};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Overrides `[link] shared_secret` so the key can stay out of config files.
pub const SECRET_ENV: &str = "DEVLINK_SHARED_SECRET";

/// Load configuration, falling back to defaults on any failure.
pub fn load_config(path: Option<&Path>) -> DevlinkConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let mut config = if config_path.exists() {
        match read_config(&config_path) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(error = %e, path = %config_path.display(), "Bad config, using defaults");
                DevlinkConfig::default()
            }
        }
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        DevlinkConfig::default()
    };

    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            config.link.shared_secret = secret;
        }
    }
    config
}

/// Read, include-merge and deserialize one config file.
pub fn read_config(path: &Path) -> DevlinkResult<DevlinkConfig> {
    let mut root = parse_file(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    resolve_includes(&mut root, dir, &mut visited, 0)?;

    root.try_into::<DevlinkConfig>()
        .map_err(|e| DevlinkError::Config(format!("{}: {e}", path.display())))
}

fn parse_file(path: &Path) -> DevlinkResult<toml::Value> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| DevlinkError::Config(format!("{}: {e}", path.display())))
}

fn take_includes(value: &mut toml::Value) -> Vec<String> {
    let toml::Value::Table(table) = value else {
        return Vec::new();
    };
    match table.remove("include") {
        Some(toml::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Resolve `include` relative to `dir`, refusing anything that would leave it.
fn include_path(dir: &Path, include: &str) -> DevlinkResult<PathBuf> {
    let relative = Path::new(include);
    if relative.is_absolute() {
        return Err(DevlinkError::Config(format!(
            "include must be a relative path: {include}"
        )));
    }
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(DevlinkError::Config(format!(
            "include may not contain '..': {include}"
        )));
    }

    let canonical = std::fs::canonicalize(dir.join(relative))
        .map_err(|e| DevlinkError::Config(format!("include '{include}' cannot be resolved: {e}")))?;
    let canonical_dir = std::fs::canonicalize(dir)?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(DevlinkError::Config(format!(
            "include '{include}' escapes the config directory"
        )));
    }
    Ok(canonical)
}

fn resolve_includes(
    root: &mut toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> DevlinkResult<()> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(DevlinkError::Config(format!(
            "includes nested deeper than {MAX_INCLUDE_DEPTH}"
        )));
    }

    let includes = take_includes(root);
    if includes.is_empty() {
        return Ok(());
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let path = include_path(dir, include)?;
        if !visited.insert(path.clone()) {
            return Err(DevlinkError::Config(format!(
                "circular include: {include}"
            )));
        }
        info!(include = %include, "Loading config include");

        let mut value = parse_file(&path)?;
        let include_dir = path.parent().unwrap_or(dir).to_path_buf();
        resolve_includes(&mut value, &include_dir, visited, depth + 1)?;
        deep_merge_toml(&mut merged, &value);
    }

    deep_merge_toml(&mut merged, root);
    *root = merged;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge key by key; anything else in
/// `overlay` replaces `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.devlink`
pub fn devlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".devlink")
}

pub fn default_config_path() -> PathBuf {
    devlink_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.proxy.query_timeout_ms, 3000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            &["[proxy]", "query_timeout_ms = 500", "", "[presence]", "enforce = true", "", "[presence.units]", "IR = [1, 2]"],
        );
        let config = read_config(&path).unwrap();
        assert_eq!(config.proxy.query_timeout_ms, 500);
        assert_eq!(config.proxy.init_timeout_ms, 3000);
        assert!(config.presence.enforce);
        assert_eq!(config.presence.units["IR"], vec![1, 2]);
        assert_eq!(config.link.listen_addr, "127.0.0.1:7420");
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value =
            toml::from_str("[link]\nlisten_addr = \"0.0.0.0:1\"\nnode_name = \"a\"").unwrap();
        let overlay: toml::Value = toml::from_str("[link]\nnode_name = \"b\"").unwrap();
        deep_merge_toml(&mut base, &overlay);
        assert_eq!(base["link"]["listen_addr"].as_str(), Some("0.0.0.0:1"));
        assert_eq!(base["link"]["node_name"].as_str(), Some("b"));
    }

    #[test]
    fn test_include_merges_under_root() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "site.toml",
            &["log_level = \"debug\"", "[link]", "shared_secret = \"from-site\"", "node_name = \"bench\""],
        );
        let root = write(
            dir.path(),
            "config.toml",
            &["include = [\"site.toml\"]", "log_level = \"warn\"", "[link]", "node_name = \"rack-3\""],
        );
        let config = read_config(&root).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.link.shared_secret, "from-site");
        assert_eq!(config.link.node_name, "rack-3");
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "timeouts.toml", &["[proxy]", "init_timeout_ms = 42"]);
        write(dir.path(), "site.toml", &["include = [\"timeouts.toml\"]", "log_level = \"debug\""]);
        let root = write(dir.path(), "config.toml", &["include = [\"site.toml\"]"]);
        let config = read_config(&root).unwrap();
        assert_eq!(config.proxy.init_timeout_ms, 42);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_circular_include_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", &["include = [\"b.toml\"]"]);
        write(dir.path(), "b.toml", &["include = [\"a.toml\"]"]);
        assert!(matches!(read_config(&a), Err(DevlinkError::Config(_))));
        assert_eq!(load_config(Some(&a)).log_level, "info");
    }

    #[test]
    fn test_traversal_and_absolute_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let up = write(dir.path(), "up.toml", &["include = [\"../etc/passwd\"]"]);
        assert!(read_config(&up).is_err());
        let abs = write(dir.path(), "abs.toml", &["include = [\"/etc/shadow\"]"]);
        assert!(read_config(&abs).is_err());
    }

    #[test]
    fn test_max_depth_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let next = format!("include = [\"level{}.toml\"]", i + 1);
            let lines: Vec<&str> = if i < 11 { vec![next.as_str()] } else { vec![] };
            write(dir.path(), &format!("level{i}.toml"), &lines);
        }
        let root = dir.path().join("level0.toml");
        assert!(read_config(&root).is_err());
    }
}
