/// `load_config` module: Loads a static YAML config file and injects the API token from the environment.
///
/// This module is the only place where untrusted YAML is parsed and mapped to the strongly-typed
/// settings of the engine (`SynchroniseConfig`) and of the HTTP remote.
///
/// # Responsibilities
/// - Parse the `input`, `engine`, `remote` and `output` sections of the YAML file
/// - Read the bearer token from the variable named by `remote.token_env` (never from the file)
/// - Turn the loose input section into a projection and validator for the core
///
/// # Errors
/// All errors in this module use `anyhow::Error` for context-rich diagnostics, and are surfaced at the CLI boundary.
use anyhow::{anyhow, Context, Result};
use catalog_sync_core::config::EngineConfig;
use catalog_sync_core::source::{Encoding, Projection, SourceOptions};
use catalog_sync_core::synchronise::{InputSpec, SynchroniseConfig};
use catalog_sync_core::validate::{Validator, DEFAULT_KEY_FIELD};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const DEFAULT_TOKEN_ENV: &str = "CATALOG_API_TOKEN";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InputSection {
    pub path: PathBuf,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default)]
    pub order_field: Option<String>,
    #[serde(default)]
    pub keep: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub require: Vec<String>,
    /// Records missing one of these become `Skipped` results instead of
    /// being dropped silently like `require`.
    #[serde(default)]
    pub skip_if_missing: Vec<String>,
}

fn default_key_field() -> String {
    DEFAULT_KEY_FIELD.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    #[default]
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Whether the operation payload is sent as the request body.
    pub fn sends_body(self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    /// Target URL; `{key}` is replaced by the operation key.
    pub url_template: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Statuses the service uses to signal congestion.
    #[serde(default = "default_backpressure_statuses")]
    pub backpressure_statuses: Vec<u16>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_backpressure_statuses() -> Vec<u16> {
    vec![429]
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub spool: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    pub input: InputSection,
    #[serde(default)]
    pub engine: EngineConfig,
    pub remote: RemoteSection,
    #[serde(default)]
    pub output: OutputSection,
    /// Injected from the environment after parsing.
    #[serde(skip)]
    pub token: Option<String>,
}

impl CliConfig {
    /// The bearer token. Missing is only acceptable for dry runs, which
    /// never reach the remote.
    pub fn bearer_token(&self) -> Result<Option<&str>> {
        match (&self.token, self.engine.dry_run) {
            (Some(token), _) => Ok(Some(token.as_str())),
            (None, true) => {
                warn!(token_env = %self.remote.token_env, "API token not set; continuing because this is a dry run");
                Ok(None)
            }
            (None, false) => {
                error!(token_env = %self.remote.token_env, "API token missing in environment");
                Err(anyhow!(
                    "environment variable {} must hold the API token",
                    self.remote.token_env
                ))
            }
        }
    }

    /// Maps the loaded sections onto the engine's run configuration.
    pub fn synchronise_config(&self) -> Result<SynchroniseConfig> {
        let input = &self.input;
        let projection = Projection::new(
            input.keep.iter().cloned(),
            input.drop.iter().cloned(),
            input.require.iter().cloned(),
        )
        .context("invalid input projection")?;
        let validator = Validator::new(input.key_field.clone())
            .with_order_field(input.order_field.clone())
            .with_required(input.skip_if_missing.iter().cloned());

        let config = SynchroniseConfig {
            input: InputSpec {
                path: input.path.clone(),
                options: SourceOptions {
                    encoding: input.encoding,
                    projection,
                    resume_after: None,
                },
                validator,
            },
            engine: self.engine.clone(),
            output_dir: self.output.dir.clone(),
            spool: self.output.spool,
        };
        config.validate().context("invalid engine settings")?;
        Ok(config)
    }

    pub fn trace_loaded(&self) {
        info!(
            input = %self.input.path.display(),
            key_field = %self.input.key_field,
            url_template = %self.remote.url_template,
            method = ?self.remote.method,
            token_present = self.token.is_some(),
            output = ?self.output.dir,
            "Loaded CliConfig"
        );
        self.engine.trace_loaded();
    }
}

/// Loads a static YAML config file (no secrets) and injects the API token
/// from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if let Err(e) = config.engine.validate() {
        error!(error = %e, config_path = ?path_ref, "Engine settings are invalid");
        return Err(e).context("invalid engine settings");
    }

    config.token = env::var(&config.remote.token_env)
        .ok()
        .filter(|t| !t.trim().is_empty());
    config.trace_loaded();
    Ok(config)
}
