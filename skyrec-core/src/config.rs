use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Remote,
}

impl ExecutionMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "aws" => Ok(Self::Remote),
            other => Err(ConfigError::InvalidValue {
                key: "system.environment".to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn environment_label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "aws",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    pub system: SystemSection,
    pub storage: StorageSection,
    pub remote: RemoteSection,
    pub reporting: ReportingSection,
    pub rendition: RenditionSection,
    pub tools: ToolsSection,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            system: SystemSection::default(),
            storage: StorageSection::default(),
            remote: RemoteSection::default(),
            reporting: ReportingSection::default(),
            rendition: RenditionSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

impl FinalizerConfig {
    /// Loads the config file when a path is given, otherwise starts from
    /// defaults. Environment overrides are applied in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_finalizer_config(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn mode(&self) -> Result<ExecutionMode> {
        ExecutionMode::parse(&self.system.environment)
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.root)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(value) = read("SKYREC_ENVIRONMENT") {
            self.system.environment = value;
        }
        if let Some(value) = read("SKYREC_STORAGE_ROOT") {
            self.storage.root = value;
        }
        if let Some(value) = read("SKYREC_API_URL") {
            self.reporting.api_base_url = value;
        }
        if let Some(value) = read("AWS_REGION") {
            self.remote.region = value;
        }
        if let Some(value) = read("AWS_BUCKET_NAME") {
            self.remote.bucket = value;
        }
        if let Some(value) = read("AWS_ENDPOINT_URL") {
            self.remote.endpoint = Some(value);
        }
        if let Some(value) = read("AWS_ACCESS_KEY_ID") {
            self.remote.access_key_id = value;
        }
        if let Some(value) = read("AWS_SECRET_ACCESS_KEY") {
            self.remote.secret_access_key = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mode = self.mode()?;
        Url::parse(&self.reporting.api_base_url).map_err(|_| ConfigError::InvalidValue {
            key: "reporting.api_base_url".to_string(),
            value: self.reporting.api_base_url.clone(),
        })?;
        if mode == ExecutionMode::Remote && self.remote.bucket.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "remote.bucket".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    pub environment: String,
    pub node_name: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            node_name: "skyrec-primary".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root: String,
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: "/var/lib/skyrec/recordings".to_string(),
            lock_timeout_ms: 5000,
            lock_poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub region: String,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            bucket: String::new(),
            endpoint: None,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportingSection {
    pub api_base_url: String,
}

impl Default for ReportingSection {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenditionSection {
    pub segment_seconds: u32,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for RenditionSection {
    fn default() -> Self {
        Self {
            segment_seconds: 10,
            poll_interval_secs: 5,
            max_wait_secs: 1800,
            kill_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub aws_cli: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            aws_cli: "aws".to_string(),
        }
    }
}

pub fn load_finalizer_config<P: AsRef<Path>>(path: P) -> Result<FinalizerConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_cover_local_development() {
        let config = FinalizerConfig::default();
        assert_eq!(config.system.environment, "local");
        assert_eq!(config.storage.root, "/var/lib/skyrec/recordings");
        assert_eq!(config.rendition.segment_seconds, 10);
        assert_eq!(config.tools.ffmpeg, "ffmpeg");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/skyrec.toml");
        let config = load_finalizer_config(path).expect("config should parse");
        assert_eq!(config.system.node_name, "skyrec-primary");
        assert_eq!(config.remote.region, "us-east-1");
        assert_eq!(config.reporting.api_base_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn mode_accepts_aws_alias() {
        assert_eq!(ExecutionMode::parse("aws").unwrap(), ExecutionMode::Remote);
        assert_eq!(
            ExecutionMode::parse("Remote").unwrap(),
            ExecutionMode::Remote
        );
        assert_eq!(ExecutionMode::parse("local").unwrap(), ExecutionMode::Local);
        assert!(ExecutionMode::parse("staging").is_err());
    }

    #[test]
    fn validate_rejects_remote_without_bucket() {
        let mut config = FinalizerConfig::default();
        config.system.environment = "aws".to_string();
        let err = config.validate().expect_err("bucket is required");
        assert!(matches!(err, ConfigError::MissingValue { .. }));

        config.remote.bucket = "skyrec-archive".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_malformed_api_url() {
        let mut config = FinalizerConfig::default();
        config.reporting.api_base_url = "not a url".to_string();
        let err = config.validate().expect_err("url should be rejected");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("SKYREC_STORAGE_ROOT", "/tmp/skyrec-test-root"),
            ("SKYREC_API_URL", "http://10.0.0.5:8000"),
        ]
        .into_iter()
        .collect();
        let mut config = FinalizerConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|value| value.to_string()));

        assert_eq!(config.storage.root, "/tmp/skyrec-test-root");
        assert_eq!(config.reporting.api_base_url, "http://10.0.0.5:8000");
        assert_eq!(config.system.environment, "local");
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let mut config = FinalizerConfig::default();
        config.apply_overrides(|name| {
            (name == "AWS_BUCKET_NAME").then(|| "   ".to_string())
        });
        assert!(config.remote.bucket.is_empty());
    }
}
