pub mod model;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use miette::NamedSource;

use model::WerfConfig;
pub use validate::ConfigError;

/// Config file names probed in the project directory, in order.
const CONFIG_FILE_NAMES: [&str; 4] = ["werf.yml", "werf.yaml", "dappfile.yml", "dappfile.yaml"];

/// Locate the config file in a project directory.
pub fn discover_config(project_dir: &Path) -> Result<PathBuf> {
    for name in CONFIG_FILE_NAMES {
        let path = project_dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(anyhow!(
        "werf.y[a]ml not found in {}",
        project_dir.display()
    ))
}

/// Load, parse and validate a config file. Returns the parsed config and the
/// raw source text (kept for validation diagnostics with source spans).
pub fn load_config(path: &Path) -> Result<(WerfConfig, String)> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "werf.yml".to_string());

    let config = parse_str(&source, &filename)?;

    if let Err(errors) = validate::validate(&config, &source, &filename) {
        let mut report = String::from("configuration errors:\n");
        for err in &errors {
            report.push_str(&format!("  - {err}\n"));
        }
        let first = errors.into_iter().next().expect("validation failed");
        return Err(anyhow::Error::new(first).context(report.trim_end().to_string()));
    }

    Ok((config, source))
}

/// Parse config source text. Syntax errors carry the offending location.
pub fn parse_str(source: &str, filename: &str) -> Result<WerfConfig, ConfigError> {
    serde_yaml::from_str(source).map_err(|e| {
        let offset = e
            .location()
            .map(|loc| loc.index().min(source.len().saturating_sub(1)))
            .unwrap_or(0);
        ConfigError::Parse {
            src: NamedSource::new(filename, source.to_string()),
            span: (offset, 1).into(),
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovers_werf_yml_first() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("werf.yml"), "project: a\n").unwrap();
        std::fs::write(dir.path().join("dappfile.yml"), "project: b\n").unwrap();
        let path = discover_config(dir.path()).unwrap();
        assert!(path.ends_with("werf.yml"));
    }

    #[test]
    fn falls_back_to_legacy_dappfile() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dappfile.yaml"), "project: a\n").unwrap();
        let path = discover_config(dir.path()).unwrap();
        assert!(path.ends_with("dappfile.yaml"));
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(discover_config(dir.path()).is_err());
    }

    #[test]
    fn parse_reports_syntax_errors() {
        let err = parse_str("project: [unclosed", "werf.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn parses_full_image_config() {
        let yaml = "project: shop\n\
                    artifacts:\n\
                    - name: libs\n\
                    \x20 from: golang:1.22\n\
                    \x20 shell:\n\
                    \x20   install:\n\
                    \x20   - go build -o /out ./...\n\
                    images:\n\
                    - name: backend\n\
                    \x20 from: alpine:3.18\n\
                    \x20 shell:\n\
                    \x20   beforeInstall:\n\
                    \x20   - apk add --no-cache ca-certificates\n\
                    \x20   install:\n\
                    \x20   - adduser -D app\n\
                    \x20 import:\n\
                    \x20 - artifact: libs\n\
                    \x20   add: /out\n\
                    \x20   to: /opt/libs\n\
                    \x20   owner: app\n\
                    \x20   before: setup\n";
        let config = parse_str(yaml, "werf.yml").unwrap();
        assert_eq!(config.project.as_deref(), Some("shop"));
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.artifacts.len(), 1);
        let import = &config.images[0].import[0];
        assert_eq!(import.artifact, "libs");
        assert_eq!(import.owner, "app");
        assert_eq!(import.before.as_deref(), Some("setup"));
    }
}
