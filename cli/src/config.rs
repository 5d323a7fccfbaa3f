//! Loading the TOML client configuration.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use classbench_lsp::ClientConfig;

/// Replace `${VAR}` with the value of the environment variable `VAR`.
///
/// Unset variables expand to the empty string; an unterminated `${` is kept
/// verbatim.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_path(path: &Path, base: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_env_vars(&path.to_string_lossy()));
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Parse a config document. Relative paths resolve against `base`.
pub fn parse_config(text: &str, base: &Path) -> Result<ClientConfig> {
    let mut config: ClientConfig = toml::from_str(text).context("parsing config")?;
    let server = &mut config.server;
    server.command = expand_env_vars(&server.command);
    server.args = server.args.iter().map(|a| expand_env_vars(a)).collect();
    server.root = expand_path(&server.root, base);
    server.working_dir = server.working_dir.as_deref().map(|dir| expand_path(dir, base));
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let base = std::path::absolute(&base).unwrap_or(base);
    let config = parse_config(&text, &base)
        .with_context(|| format!("invalid config {}", path.display()))?;
    tracing::debug!(command = %config.server.command, root = %config.server.root.display(), "loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        // PATH is set in any test environment.
        let path = env::var("PATH").unwrap();
        assert_eq!(expand_env_vars("${PATH}"), path);
        assert_eq!(expand_env_vars("a${CLASSBENCH_SURELY_UNSET}b"), "ab");
        assert_eq!(expand_env_vars("keep ${open"), "keep ${open");
        assert_eq!(expand_env_vars("${}x"), "x");
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_parse_config_resolves_relative_paths() {
        let text = r#"
            [server]
            command = "jdtls"
            args = ["-data", "ws"]
            root = "repo"
            working_dir = "/tmp"
            language_id = "java"

            [handshake]
            required_methods = ["textDocument/completion"]

            [retry]
            max_attempts = 4
        "#;
        let config = parse_config(text, Path::new("/configs")).unwrap();
        assert_eq!(config.server.root, PathBuf::from("/configs/repo"));
        assert_eq!(config.server.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.server.args, vec!["-data", "ws"]);
        assert_eq!(config.handshake.required_methods, vec!["textDocument/completion"]);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.timeouts.request_secs, 30);
    }

    #[test]
    fn test_settings_table_becomes_json() {
        let text = r#"
            [server]
            command = "OmniSharp"
            root = "/repo"
            language_id = "csharp"

            [server.settings.csharp]
            format = true
        "#;
        let config = parse_config(text, Path::new("/")).unwrap();
        let settings = config.server.settings.unwrap();
        assert_eq!(settings["csharp"]["format"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_missing_server_section_is_error() {
        assert!(parse_config("[retry]\nmax_attempts = 1\n", Path::new("/")).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classbench.toml");
        std::fs::write(
            &path,
            "[server]\ncommand = \"jdtls\"\nroot = \"proj\"\nlanguage_id = \"java\"\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.root, dir.path().join("proj"));
    }
}
