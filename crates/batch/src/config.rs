use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use avagen_core::job_table::{is_safe_avatar_id, DEFAULT_LABEL_NAMESPACE};

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";
/// Default avatar table location.
pub const DEFAULT_AVATAR_TABLE: &str = "config/avatars.json";
/// Default local directory images are written under.
pub const DEFAULT_OUTPUT_DIR: &str = "public/avatars";
/// Default seconds between poll sweeps.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
/// Default limit on each ComfyUI HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Default limit on each `scp` copy.
pub const DEFAULT_COPY_TIMEOUT_SECS: u64 = 120;
/// Default ComfyUI output directory on the remote host.
pub const DEFAULT_REMOTE_OUTPUT_DIR: &str = "/opt/ComfyUI/output";

/// How finished images are brought back from the ComfyUI host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// `scp` from the server's output directory.
    Scp,
    /// `GET /view` on the ComfyUI API.
    Http,
}

impl FromStr for FetchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scp" => Ok(FetchMode::Scp),
            "http" => Ok(FetchMode::Http),
            other => Err(format!("expected 'scp' or 'http', got '{other}'")),
        }
    }
}

/// Batch runner configuration loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI server on the local
/// machine. Override via environment variables or a `.env` file.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// ComfyUI HTTP base URL.
    pub api_url: String,
    /// JSON avatar table.
    pub avatar_table: PathBuf,
    /// Local directory images are written under.
    pub output_dir: PathBuf,
    /// Job graph template file; the built-in Flux template when `None`.
    pub workflow_template: Option<PathBuf>,
    /// First component of every artifact filename prefix.
    pub label_namespace: String,
    /// Sleep before each poll sweep.
    pub poll_interval: Duration,
    /// Abandon a job after this many unsuccessful polls. `None` polls
    /// forever.
    pub max_poll_attempts: Option<u32>,
    /// Limit on each ComfyUI HTTP request, including `/view` downloads.
    pub request_timeout: Duration,
    /// Limit on each `scp` copy.
    pub copy_timeout: Duration,
    pub fetch_mode: FetchMode,
    /// SSH host for [`FetchMode::Scp`].
    pub remote_host: String,
    /// ComfyUI output directory on `remote_host`.
    pub remote_output_dir: String,
}

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl BatchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                         |
    /// |------------------------|---------------------------------|
    /// | `COMFYUI_API_URL`      | `http://127.0.0.1:8188`         |
    /// | `AVATAR_TABLE`         | `config/avatars.json`           |
    /// | `OUTPUT_DIR`           | `public/avatars`                |
    /// | `WORKFLOW_TEMPLATE`    | built-in Flux template          |
    /// | `LABEL_NAMESPACE`      | `regen`                         |
    /// | `POLL_INTERVAL_SECS`   | `10`                            |
    /// | `MAX_POLL_ATTEMPTS`    | unset (poll forever)            |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                            |
    /// | `COPY_TIMEOUT_SECS`    | `120`                           |
    /// | `FETCH_MODE`           | `scp`                           |
    /// | `REMOTE_HOST`          | host of `COMFYUI_API_URL`       |
    /// | `REMOTE_OUTPUT_DIR`    | `/opt/ComfyUI/output`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = get("COMFYUI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into());
        let url = reqwest::Url::parse(&api_url).map_err(|e| ConfigError::Invalid {
            var: "COMFYUI_API_URL",
            value: api_url.clone(),
            reason: e.to_string(),
        })?;

        let remote_host = match get("REMOTE_HOST") {
            Some(host) => host,
            None => url
                .host_str()
                .map(str::to_string)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "COMFYUI_API_URL",
                    value: api_url.clone(),
                    reason: "URL has no host; set REMOTE_HOST".into(),
                })?,
        };

        let poll_interval_secs: u64 = parse_var(&get, "POLL_INTERVAL_SECS")?
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let max_poll_attempts: Option<u32> = parse_var(&get, "MAX_POLL_ATTEMPTS")?;
        if max_poll_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                var: "MAX_POLL_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let request_timeout_secs = positive_secs(&get, "REQUEST_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let copy_timeout_secs =
            positive_secs(&get, "COPY_TIMEOUT_SECS")?.unwrap_or(DEFAULT_COPY_TIMEOUT_SECS);

        let fetch_mode = parse_var(&get, "FETCH_MODE")?.unwrap_or(FetchMode::Scp);

        // Ends up in every remote filename prefix, so it gets the avatar id rules.
        let label_namespace =
            get("LABEL_NAMESPACE").unwrap_or_else(|| DEFAULT_LABEL_NAMESPACE.into());
        if !is_safe_avatar_id(&label_namespace) {
            return Err(ConfigError::Invalid {
                var: "LABEL_NAMESPACE",
                value: label_namespace,
                reason: "use letters, digits, '-', '_' or '.'".into(),
            });
        }

        Ok(Self {
            api_url,
            avatar_table: get("AVATAR_TABLE")
                .unwrap_or_else(|| DEFAULT_AVATAR_TABLE.into())
                .into(),
            output_dir: get("OUTPUT_DIR")
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into())
                .into(),
            workflow_template: get("WORKFLOW_TEMPLATE").map(PathBuf::from),
            label_namespace,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_poll_attempts,
            request_timeout: Duration::from_secs(request_timeout_secs),
            copy_timeout: Duration::from_secs(copy_timeout_secs),
            fetch_mode,
            remote_host,
            remote_output_dir: get("REMOTE_OUTPUT_DIR")
                .unwrap_or_else(|| DEFAULT_REMOTE_OUTPUT_DIR.into()),
        })
    }
}

/// Parse an optional variable, mapping parse failures to
/// [`ConfigError::Invalid`].
fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Like [`parse_var`] for a seconds count that must be at least 1.
fn positive_secs<G>(get: &G, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_var::<u64, G>(get, var)? {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be at least 1".into(),
        }),
        secs => Ok(secs),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<BatchConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BatchConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();

        assert_eq!(c.api_url, DEFAULT_API_URL);
        assert_eq!(c.avatar_table, PathBuf::from("config/avatars.json"));
        assert_eq!(c.output_dir, PathBuf::from("public/avatars"));
        assert_eq!(c.workflow_template, None);
        assert_eq!(c.label_namespace, "regen");
        assert_eq!(c.poll_interval, Duration::from_secs(10));
        assert_eq!(c.max_poll_attempts, None);
        assert_eq!(c.request_timeout, Duration::from_secs(30));
        assert_eq!(c.copy_timeout, Duration::from_secs(120));
        assert_eq!(c.fetch_mode, FetchMode::Scp);
        assert_eq!(c.remote_host, "127.0.0.1");
        assert_eq!(c.remote_output_dir, DEFAULT_REMOTE_OUTPUT_DIR);
    }

    #[test]
    fn remote_host_follows_api_url() {
        let c = config(&[("COMFYUI_API_URL", "http://10.0.0.239:4455")]).unwrap();
        assert_eq!(c.remote_host, "10.0.0.239");

        let c = config(&[
            ("COMFYUI_API_URL", "http://10.0.0.239:4455"),
            ("REMOTE_HOST", "gpu-box"),
        ])
        .unwrap();
        assert_eq!(c.remote_host, "gpu-box");
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("POLL_INTERVAL_SECS", "3"),
            ("MAX_POLL_ATTEMPTS", "120"),
            ("FETCH_MODE", "HTTP"),
            ("LABEL_NAMESPACE", "chessv3"),
            ("WORKFLOW_TEMPLATE", "graphs/flux.json"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("COPY_TIMEOUT_SECS", "45"),
        ])
        .unwrap();

        assert_eq!(c.request_timeout, Duration::from_secs(5));
        assert_eq!(c.copy_timeout, Duration::from_secs(45));

        assert_eq!(c.poll_interval, Duration::from_secs(3));
        assert_eq!(c.max_poll_attempts, Some(120));
        assert_eq!(c.fetch_mode, FetchMode::Http);
        assert_eq!(c.label_namespace, "chessv3");
        assert_eq!(c.workflow_template, Some(PathBuf::from("graphs/flux.json")));
    }

    #[test]
    fn empty_value_counts_as_unset() {
        let c = config(&[("MAX_POLL_ATTEMPTS", ""), ("OUTPUT_DIR", "  ")]).unwrap();
        assert_eq!(c.max_poll_attempts, None);
        assert_eq!(c.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            config(&[("POLL_INTERVAL_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_SECS", .. })
        );
        assert_matches!(
            config(&[("FETCH_MODE", "ftp")]),
            Err(ConfigError::Invalid { var: "FETCH_MODE", .. })
        );
        assert_matches!(
            config(&[("MAX_POLL_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid { var: "MAX_POLL_ATTEMPTS", .. })
        );
        assert_matches!(
            config(&[("REQUEST_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { var: "REQUEST_TIMEOUT_SECS", .. })
        );
        assert_matches!(
            config(&[("COMFYUI_API_URL", "not a url")]),
            Err(ConfigError::Invalid { var: "COMFYUI_API_URL", .. })
        );
    }

    #[test]
    fn label_namespace_must_be_a_safe_filename_part() {
        for bad in ["../up", "a/b", "name space", ".."] {
            assert_matches!(
                config(&[("LABEL_NAMESPACE", bad)]),
                Err(ConfigError::Invalid { var: "LABEL_NAMESPACE", .. }),
                "{bad:?} should be rejected"
            );
        }
        let c = config(&[("LABEL_NAMESPACE", "chess_v3")]).unwrap();
        assert_eq!(c.label_namespace, "chess_v3");
    }
}
