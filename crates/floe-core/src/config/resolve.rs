use std::fmt;
use std::path::{Path, PathBuf};

use floe_types::error::{FloeError, Result};

use super::types::FloeConfig;

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(offset) = input[cursor..].find("${") {
        let start = cursor + offset;
        out.push_str(&input[cursor..start]);

        let token_start = start + 2;
        let Some(token_end_rel) = input[token_start..].find('}') else {
            return Err(config_expand_error(
                path,
                input,
                start,
                "unterminated environment placeholder",
            ));
        };
        let token_end = token_start + token_end_rel;
        let token = &input[token_start..token_end];
        out.push_str(&resolve_env_token(token, path, input, start)?);
        cursor = token_end + 1;
    }

    out.push_str(&input[cursor..]);
    Ok(out)
}

fn resolve_env_token(token: &str, path: &Path, input: &str, start: usize) -> Result<String> {
    let (name, default) = match token.find(":-") {
        Some(split_at) => (&token[..split_at], Some(&token[split_at + 2..])),
        None => (token, None),
    };
    if !is_valid_env_var_name(name) {
        return Err(config_expand_error(
            path,
            input,
            start,
            format!("invalid environment variable name '{name}'"),
        ));
    }

    match (std::env::var(name), default) {
        (Ok(value), Some(default)) if value.is_empty() => Ok(default.to_string()),
        (Ok(value), _) => Ok(value),
        (Err(std::env::VarError::NotPresent), Some(default)) => Ok(default.to_string()),
        (Err(std::env::VarError::NotPresent), None) => Err(config_expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not set"),
        )),
        (Err(std::env::VarError::NotUnicode(_)), _) => Err(config_expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not valid UTF-8"),
        )),
    }
}

fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn config_expand_error(
    path: &Path,
    input: &str,
    start: usize,
    message: impl fmt::Display,
) -> FloeError {
    let (line, column) = byte_offset_to_line_col(input, start);
    FloeError::Config(format!(
        "invalid config '{}': {message} at line {line}, column {column}",
        path.display()
    ))
}

fn byte_offset_to_line_col(input: &str, byte_offset: usize) -> (usize, usize) {
    let mut line = 1usize;
    let mut column = 1usize;
    for ch in input[..byte_offset].chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `FLOE_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (FLOE_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("floe.yaml"), "project")];

    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("floe").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    paths.push((PathBuf::from("/etc/floe/config.yaml"), "system"));
    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `FLOE_CONFIG` env var > first existing file from search paths.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var("FLOE_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<FloeConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        FloeError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let expanded = expand_env_placeholders(&raw, path)?;
    let mut config: FloeConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| FloeError::Config(format!("invalid config '{}': {e}", path.display())))?;
    config.source_path = Some(path.to_path_buf());
    config.validate()?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# floe configuration file

remote:
  url: s3://s3.us-east-1.amazonaws.com/my-archive-bucket
  region: us-east-1
  # access_key_id / secret_access_key default to AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
  prefix: "{year}-backup/"
  bag_storage_class: DEEP_ARCHIVE

archive:
  bag_size: 40G
  min_retention_days: 180
  scan_interval_days: 190

branches:
  # Each child directory is packed into shared bags.
  - /srv/media ::COMPRESS
  # The whole branch is one atom in its own bags.
  - path: /srv/projects/thesis
    mode: sovereign
    tags: [encrypt, locked]
    exclude: ["*.tmp"]
  # Remote branches are mounted with sshfs before scanning.
  # - backup@nas:/volume1/photos ::IMMUTABLE

# --- Common optional settings (uncomment as needed) ---

# encryption:
#   passphrase: "${FLOE_PASSPHRASE}"
#   cipher: aes256gcm
#
# compression:
#   algorithm: gzip
#
# limits:
#   upload_mib_per_sec: 20
#   transfer_concurrency: 2
#
# exclude_patterns:
#   - ".cache/"
#   - "*.part"
#
# pricing:
#   price_per_gb_month: 0.00099
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    // Tests that mutate process-global state (env vars) must be serialized.
    static GLOBAL_STATE: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_search_paths_order() {
        let paths = default_config_search_paths();
        assert!(paths.len() >= 2);
        assert_eq!(paths[0].1, "project");
        assert_eq!(paths.last().unwrap().1, "system");
    }

    #[test]
    fn test_cli_arg_wins() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _env = EnvGuard::set("FLOE_CONFIG", "/tmp/from-env.yaml");
        let source = resolve_config_path(Some("/tmp/cli.yaml")).unwrap();
        assert!(matches!(source, ConfigSource::CliArg(_)));
        assert_eq!(source.path(), Path::new("/tmp/cli.yaml"));
    }

    #[test]
    fn test_env_var_used_without_cli_arg() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _env = EnvGuard::set("FLOE_CONFIG", "/tmp/from-env.yaml");
        let source = resolve_config_path(None).unwrap();
        assert!(matches!(source, ConfigSource::EnvVar(_)));
        assert!(source.to_string().contains("FLOE_CONFIG"));
    }

    #[test]
    fn test_env_placeholders_expand() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _a = EnvGuard::set("FLOE_TEST_BUCKET", "cold");
        let _b = EnvGuard::unset("FLOE_TEST_MISSING");
        let path = Path::new("floe.yaml");
        let out = expand_env_placeholders(
            "url: s3://h/${FLOE_TEST_BUCKET}\nx: ${FLOE_TEST_MISSING:-fallback}",
            path,
        )
        .unwrap();
        assert_eq!(out, "url: s3://h/cold\nx: fallback");

        let err = expand_env_placeholders("a: 1\nb: ${FLOE_TEST_MISSING}", path).unwrap_err();
        assert!(err.to_string().contains("line 2, column 4"));
        assert!(expand_env_placeholders("${unterminated", path).is_err());
        assert!(expand_env_placeholders("${1BAD}", path).is_err());
    }

    #[test]
    fn test_load_config_applies_defaults() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _env = EnvGuard::unset("FLOE_PASSPHRASE");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floe.yaml");
        fs::write(
            &path,
            "remote:\n  url: /srv/cold\nbranches:\n  - /data/media ::COMPRESS\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.archive.min_retention_days, 180);
        assert_eq!(config.archive.bag_capacity().unwrap(), 40 * 1024 * 1024 * 1024);
        assert_eq!(config.remote.prefix, "{year}-backup/");
        assert_eq!(config.branches().unwrap().len(), 1);
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_load_config_rejects_encrypt_without_secret() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _env = EnvGuard::unset("FLOE_PASSPHRASE");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floe.yaml");
        fs::write(
            &path,
            "remote:\n  url: /srv/cold\nbranches:\n  - /data/docs ::ENCRYPT\n",
        )
        .unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, FloeError::Config(_)));
        assert!(err.to_string().contains("ENCRYPT"));
    }

    #[test]
    fn test_load_config_rejects_duplicate_branches() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floe.yaml");
        fs::write(
            &path,
            "remote:\n  url: /srv/cold\nbranches:\n  - /data/a\n  - path: /data/a\n",
        )
        .unwrap();
        assert!(load_config(&path)
            .unwrap_err()
            .to_string()
            .contains("more than once"));
    }

    #[test]
    fn test_minimal_template_parses() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _env = EnvGuard::set("FLOE_PASSPHRASE", "x");
        let config: FloeConfig = serde_yaml::from_str(minimal_config_template()).unwrap();
        assert_eq!(config.branches().unwrap().len(), 2);
        config.validate().unwrap();
    }
}
