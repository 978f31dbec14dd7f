//! Configuration loading and validation.
//!
//! A file is read, `${VAR}` references are substituted, the YAML is parsed
//! into a [`BridgeConfig`], and [`BridgeConfig::validate`] checks that it
//! converts into the runtime structs the bridge runs on.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::error::ConfigError;
use super::schema::{BridgeConfig, DEFAULT_POLICER_TIMEOUT, PolicerYamlConfig, ServerConfig};
use crate::auth::Auth;
use crate::pipeline::PipelineOptions;
use crate::policer::{PolicerConfig, build_policer};
use crate::process::{Credentials, StdioServer};
use crate::sbom::Sbom;
use crate::session::SessionOptions;
use crate::telemetry::TelemetryConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "MINIBRIDGE_CONFIG";

/// Configuration file search paths, in priority order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/minibridge/config.yaml"));
    paths.push(PathBuf::from("./minibridge.yaml"));
    paths
}

/// Returns `explicit_path` if it exists, or the first existing default path.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    match paths.iter().find(|p| p.exists()) {
        Some(path) => Ok(path.clone()),
        None => Err(ConfigError::ConfigFileNotFound { searched: paths }),
    }
}

/// Reads, substitutes and parses a configuration file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let contents = read(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    Ok(serde_saphyr::from_str(&contents)?)
}

/// Loads a configuration file and validates it.
pub fn load_and_validate(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let config = load_config(path)?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment Variable Substitution
// ─────────────────────────────────────────────────────────────────────────────

// The pattern is a literal; test_env_var_pattern_compiles covers it.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitutes environment variables in `content`.
///
/// - `${VAR}` is required and fails when unset
/// - `${VAR:-default}` falls back to `default`
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &Captures<'_>| {
        let var = &cap[1];
        match (std::env::var(var), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar { var }),
        None => Ok(result.into_owned()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation and Conversion
// ─────────────────────────────────────────────────────────────────────────────

fn to_u32(field: &'static str, value: i64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::IdOverflow { field, value })
}

impl ServerConfig {
    fn credentials(&self) -> Result<Credentials, ConfigError> {
        Ok(Credentials {
            uid: self.uid.map(|v| to_u32("uid", v)).transpose()?,
            gid: self.gid.map(|v| to_u32("gid", v)).transpose()?,
            groups: self
                .groups
                .iter()
                .map(|v| to_u32("group", *v))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl BridgeConfig {
    /// Checks every section converts into its runtime form.
    ///
    /// Policy and manifest files are read, and the policy is compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stdio_server()?;
        self.session_options()?;
        if let Some(policer) = self.policer_config()? {
            build_policer(&policer)?;
        }
        self.load_sbom()?;
        Ok(())
    }

    pub fn stdio_server(&self) -> Result<StdioServer, ConfigError> {
        let server = &self.server;
        if server.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        Ok(StdioServer {
            command: server.command.clone(),
            args: server.args.clone(),
            env: server
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            use_tempdir: server.use_tempdir,
            credentials: server.credentials()?,
        })
    }

    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        if self.session.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(SessionOptions {
            idle_timeout: self.session.idle_timeout,
        })
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            enabled: self.telemetry.enabled,
            service_name: self.telemetry.service_name.clone(),
        }
    }

    /// Resolves the policer section, reading the policy file if needed.
    pub fn policer_config(&self) -> Result<Option<PolicerConfig>, ConfigError> {
        let Some(policer) = &self.policer else {
            return Ok(None);
        };

        let config = match policer {
            PolicerYamlConfig::Http {
                url,
                token,
                user,
                password,
                timeout,
                skip_tls_verify,
            } => {
                let url = url.as_deref().ok_or(ConfigError::MissingPolicerUrl)?;
                reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

                let auth = match (user, token) {
                    (Some(user), _) => Some(Auth::basic(
                        user.clone(),
                        password.clone().unwrap_or_default(),
                    )),
                    (None, Some(token)) => Some(Auth::bearer(token.clone())),
                    (None, None) => None,
                };

                PolicerConfig::Http {
                    url: url.to_string(),
                    auth,
                    timeout: timeout.unwrap_or(DEFAULT_POLICER_TIMEOUT),
                    skip_tls_verify: *skip_tls_verify,
                }
            }
            PolicerYamlConfig::Rego {
                policy,
                policy_file,
            } => {
                let policy = match (policy, policy_file) {
                    (Some(_), Some(_)) => return Err(ConfigError::ConflictingPolicy),
                    (Some(policy), None) => policy.clone(),
                    (None, Some(path)) => read(path)?,
                    (None, None) => return Err(ConfigError::MissingPolicy),
                };
                PolicerConfig::Rego { policy }
            }
        };

        Ok(Some(config))
    }

    pub fn load_sbom(&self) -> Result<Option<Sbom>, ConfigError> {
        match &self.sbom {
            Some(path) => Ok(Some(Sbom::load(path)?)),
            None => Ok(None),
        }
    }

    /// Builds the policing options: loads the manifest and compiles the policer.
    pub fn pipeline_options(&self) -> Result<PipelineOptions, ConfigError> {
        let policer = match self.policer_config()? {
            Some(config) => Some(build_policer(&config)?),
            None => None,
        };

        Ok(PipelineOptions {
            enforce: self.enforce,
            sbom: self.load_sbom()?,
            policer,
        })
    }
}
