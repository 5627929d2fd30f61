use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;
use vigil_core::CoordinationConfig;

/// Where the coordination tunables came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CoordinationConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

const PATH_VAR: &str = "VIGIL_CONFIG_PATH";
const INLINE_VAR: &str = "VIGIL_CONFIG_JSON";
const DEFAULT_FILES: &[&str] = &["vigil.toml", "config/vigil.toml", "vigil.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Format::Toml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }

    fn parse(self, contents: &str) -> anyhow::Result<CoordinationConfig> {
        match self {
            Format::Toml => toml::from_str(contents).map_err(|err| anyhow!("toml: {err}")),
            Format::Json => {
                serde_json::from_str(contents).map_err(|err| anyhow!("json: {err}"))
            }
        }
    }
}

/// Resolve tunables from `$VIGIL_CONFIG_PATH`, then `$VIGIL_CONFIG_JSON`,
/// then the first of the default files under the working directory, falling
/// back to built-in defaults.
pub fn load_from_env()
-> anyhow::Result<(CoordinationConfig, CoordinationConfigSource)> {
    resolve(|var| env::var(var).ok(), Path::new("."))
}

fn resolve(
    lookup: impl Fn(&str) -> Option<String>,
    root: &Path,
) -> anyhow::Result<(CoordinationConfig, CoordinationConfigSource)> {
    let set = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

    if let Some(path) = set(PATH_VAR) {
        let path = PathBuf::from(path);
        return Ok((read_config(&path)?, CoordinationConfigSource::EnvPath(path)));
    }

    if let Some(raw) = set(INLINE_VAR) {
        let config = Format::Json
            .parse(&raw)
            .with_context(|| format!("${INLINE_VAR} is not a valid coordination config"))?;
        return Ok((config, CoordinationConfigSource::EnvInline));
    }

    let default_file = DEFAULT_FILES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file());
    match default_file {
        Some(path) => Ok((read_config(&path)?, CoordinationConfigSource::File(path))),
        None => Ok((CoordinationConfig::default(), CoordinationConfigSource::Default)),
    }
}

/// Read a TOML or JSON tunables file. Files without a recognised extension
/// are accepted in either format.
pub fn read_config(path: &Path) -> anyhow::Result<CoordinationConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read coordination config {}", path.display())
    })?;

    let parsed = match Format::of(path) {
        Some(format) => format.parse(&contents),
        None => Format::Toml.parse(&contents).or_else(|toml_err| {
            Format::Json
                .parse(&contents)
                .map_err(|json_err| anyhow!("neither {toml_err} nor {json_err}"))
        }),
    };
    parsed.with_context(|| format!("invalid coordination config {}", path.display()))
}

/// Check that `raw` names a Postgres database.
pub fn validate_database_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).context("invalid PostgreSQL URL")?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(anyhow!(
            "database URL scheme must be postgres or postgresql, got `{}`",
            url.scheme()
        ));
    }
    if url.path().trim_start_matches('/').is_empty() {
        return Err(anyhow!("database URL must include database name"));
    }
    Ok(url)
}

/// Parse `10s`, `1m 30s` and friends.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(raw.trim())
        .map_err(|err| format!("invalid duration `{raw}`: {err}"))?;
    if duration.is_zero() {
        return Err(format!("duration `{raw}` must be positive"));
    }
    Ok(duration)
}

/// Backend identity as recorded in `metadata` on check-in.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendMetadata {
    pub version: String,
    pub instance: String,
}
