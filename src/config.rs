use crate::error::AklogError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/aklog.toml";
pub const DEFAULT_AFS_CONFIG_DIR: &str = "/usr/vice/etc";
pub const DEFAULT_KRB5_CONFIG: &str = "/etc/krb5.conf";
pub const DEFAULT_KRB524_PORT: u16 = 4444;

fn default_afs_config_dir() -> PathBuf {
    PathBuf::from(DEFAULT_AFS_CONFIG_DIR)
}

fn default_max_symlinks() -> usize {
    20
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_kvno_command() -> String {
    "kvno".to_string()
}

fn default_pts_command() -> String {
    "pts".to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFormatKind {
    #[default]
    Native,
    Krb524,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_afs_config_dir")]
    pub afs_config_dir: PathBuf,
    pub krb5_config: Option<PathBuf>,
    pub ccache: Option<String>,
    #[serde(default = "default_max_symlinks")]
    pub max_symlinks: usize,
    /// Seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: u64,
    #[serde(default)]
    pub token_format: TokenFormatKind,
    #[serde(default = "default_kvno_command")]
    pub kvno_command: String,
    #[serde(default = "default_pts_command")]
    pub pts_command: String,
    #[serde(default)]
    pub allow_register: bool,
    #[serde(default)]
    pub domain_realm: BTreeMap<String, String>,
    #[serde(default)]
    pub krb524_servers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            afs_config_dir: default_afs_config_dir(),
            krb5_config: None,
            ccache: None,
            max_symlinks: default_max_symlinks(),
            attempt_timeout: default_attempt_timeout(),
            token_format: TokenFormatKind::default(),
            kvno_command: default_kvno_command(),
            pts_command: default_pts_command(),
            allow_register: false,
            domain_realm: BTreeMap::new(),
            krb524_servers: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, AklogError> {
        let mut contents = String::new();
        let mut f = fs::File::open(&path).map_err(|err| {
            error!(?err, path = %path.as_ref().display(), "unable to open configuration");
            AklogError::ConfigParse
        })?;
        f.read_to_string(&mut contents).map_err(|err| {
            error!(?err, "unable to read configuration");
            AklogError::IoError
        })?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config, AklogError> {
        toml::from_str(contents).map_err(|err| {
            error!(?err);
            AklogError::ConfigParse
        })
    }

    /// Load `path` if given. Otherwise the default path is tried, and a missing
    /// default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, AklogError> {
        match path {
            Some(p) => Self::parse(p),
            None => match fs::metadata(DEFAULT_CONFIG_PATH) {
                Ok(_) => Self::parse(DEFAULT_CONFIG_PATH),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("no configuration at {}, using defaults", DEFAULT_CONFIG_PATH);
                    Ok(Config::default())
                }
                Err(err) => {
                    error!(?err, "unable to stat {}", DEFAULT_CONFIG_PATH);
                    Err(AklogError::IoError)
                }
            },
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout)
    }

    /// `$KRB5_CONFIG` wins over the file, which wins over the default.
    pub fn krb5_config_path(&self) -> PathBuf {
        std::env::var_os("KRB5_CONFIG")
            .map(PathBuf::from)
            .or_else(|| self.krb5_config.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KRB5_CONFIG))
    }
}
