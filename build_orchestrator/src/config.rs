use std::{path::Path, time::Duration};

use stacked_errors::{bail, Result, StackableErr};

use crate::options::BuildOptions;

/// Daemon address, in the `CONTAINER_HOST` format Podman uses
/// (`tcp://host:port` or `http://host:port`)
pub const CONTAINER_HOST_ENV_VAR_NAME: &str = "CONTAINER_HOST";
/// Default HTTP timeout in seconds
pub const TIMEOUT_ENV_VAR_NAME: &str = "BUILD_ORCHESTRATOR_TIMEOUT";

pub const DEFAULT_CONTAINER_HOST: &str = "tcp://localhost:8888";
pub const DEFAULT_API_VERSION: &str = "5.0.0";

/// Where and how to reach the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub api_version: String,
    /// Applied to requests that do not set their own timeout
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CONTAINER_HOST.to_owned(),
            api_version: DEFAULT_API_VERSION.to_owned(),
            timeout: None,
            user_agent: format!("build_orchestrator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by [CONTAINER_HOST_ENV_VAR_NAME] and
    /// [TIMEOUT_ENV_VAR_NAME] when they are set
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(CONTAINER_HOST_ENV_VAR_NAME) {
            config.host = host;
        }
        if let Ok(timeout) = std::env::var(TIMEOUT_ENV_VAR_NAME) {
            let secs: u64 = timeout
                .trim()
                .parse()
                .stack_err_with(|| format!("{TIMEOUT_ENV_VAR_NAME}=\"{timeout}\""))?;
            config.timeout = Some(Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// The libpod API root, e.x. `http://localhost:8888/v5.0.0/libpod`
    pub fn base_url(&self) -> Result<url::Url> {
        let host = self.host.trim_end_matches('/');
        let http_host = if let Some(rest) = host.strip_prefix("tcp://") {
            format!("http://{rest}")
        } else if host.starts_with("http://") || host.starts_with("https://") {
            host.to_owned()
        } else {
            bail!("ClientConfig::base_url -> unsupported container host \"{host}\", expected tcp:// or http(s)://")
        };
        let url = format!("{http_host}/v{}/libpod", self.api_version);
        url::Url::parse(&url).stack_err_with(|| format!("ClientConfig::base_url -> {url}"))
    }
}

/// Reads [BuildOptions] from a JSON file. Fields the file does not mention
/// keep their defaults and fields this crate does not know are ignored.
pub async fn load_build_options(path: impl AsRef<Path>) -> Result<BuildOptions> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .stack_err_with(|| format!("load_build_options(path: {path:?})"))?;
    serde_json::from_str(&contents).stack_err_with(|| format!("load_build_options(path: {path:?})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls() {
        let mut config = ClientConfig::default();
        assert_eq!(
            config.base_url().unwrap().as_str(),
            "http://localhost:8888/v5.0.0/libpod"
        );
        config.host = "https://builder.internal:443/".to_owned();
        assert_eq!(
            config.base_url().unwrap().as_str(),
            "https://builder.internal/v5.0.0/libpod"
        );
        config.host = "unix:///run/podman/podman.sock".to_owned();
        assert!(config.base_url().is_err());
    }

    #[tokio::test]
    async fn options_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        tokio::fs::write(
            &path,
            r#"{
                "tag": "myimage:latest",
                "buildargs": {"A": "1"},
                "volumes": {"/tmp/cache": {"bind": "/var/cache", "mode": ["rw", "z"]}},
                "use_config_proxy": true
            }"#,
        )
        .await
        .unwrap();
        let opts = load_build_options(&path).await.unwrap();
        assert_eq!(opts.tag.as_deref(), Some("myimage:latest"));
        let params = opts.to_query_params().unwrap();
        assert_eq!(params.get("volume"), Some("/tmp/cache:/var/cache:rw,z"));
        assert_eq!(params.get("layers"), Some("true"));

        assert!(load_build_options(dir.path().join("missing.json"))
            .await
            .is_err());
    }
}
