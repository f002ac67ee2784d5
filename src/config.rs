use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

// pipeline configuration as read in(e.g. from a toml file)
#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    // PartField checkout, must contain the two pipeline entry scripts
    #[serde(default = "detect_partfield_dir")]
    pub partfield_dir: PathBuf,

    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    // relative to partfield_dir
    #[serde(default = "default_config_file")]
    pub config_file: String,

    // relative to partfield_dir
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,

    // where the inference script dumps per-job features, relative to partfield_dir
    #[serde(default = "default_features_subdir")]
    pub features_subdir: String,

    pub expiry_hours: Option<u64>,

    pub val_num_workers: Option<u32>,

    pub val_batch_size: Option<u32>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            partfield_dir: detect_partfield_dir(),
            python_bin: default_python_bin(),
            config_file: default_config_file(),
            checkpoint: default_checkpoint(),
            features_subdir: default_features_subdir(),
            expiry_hours: None,
            val_num_workers: None,
            val_batch_size: None,
        }
    }
}

impl PortalConfig {
    // the per-job directory the inference stage writes its features into
    pub fn features_dir(&self, result_name: &str) -> PathBuf {
        self.partfield_dir
            .join(&self.features_subdir)
            .join(result_name)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_hours.unwrap_or(24) * 3600)
    }

    pub fn val_num_workers(&self) -> u32 {
        self.val_num_workers.unwrap_or(2)
    }

    pub fn val_batch_size(&self) -> u32 {
        self.val_batch_size.unwrap_or(1)
    }
}

// prefer a checkout next to the working directory, fall back to the
// conventional /workspace install
fn detect_partfield_dir() -> PathBuf {
    if let Ok(cwd) = env::current_dir() {
        if cwd.join("partfield_inference.py").exists() {
            return cwd;
        }
    }
    PathBuf::from("/workspace/partfield")
}

fn default_python_bin() -> String {
    "python".to_string()
}

fn default_config_file() -> String {
    "configs/final/demo.yaml".to_string()
}

fn default_checkpoint() -> String {
    "model/model_objaverse.ckpt".to_string()
}

fn default_features_subdir() -> String {
    "exp_results".to_string()
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<PortalConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&raw)?)
        }
        None => Ok(PortalConfig::default()),
    }
}
