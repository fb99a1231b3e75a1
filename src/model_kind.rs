use std::fs;

use serde::{Deserialize, Serialize};
use tch::nn;
use tracing::info;

use crate::{
    error::Result,
    unet::{AttnUNet, AttnUNetConfig, CropUNet, CropUNetConfig, NoisePredictor},
};

/// Selects which noise prediction network to build, tagged so that a single
/// TOML file can describe either variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_name", content = "model_args")]
pub enum ModelKind {
    AttnUNet(AttnUNetConfig),
    CropUNet(CropUNetConfig),
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::AttnUNet(AttnUNetConfig::default())
    }
}

impl ModelKind {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: ModelKind = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn in_channels(&self) -> i64 {
        match self {
            ModelKind::AttnUNet(config) => config.in_channels,
            ModelKind::CropUNet(config) => config.in_channels,
        }
    }

    pub fn build(&self, vs: nn::Path) -> Result<Box<dyn NoisePredictor>> {
        info!(model = ?self, "building noise predictor");
        match self {
            ModelKind::AttnUNet(config) => Ok(Box::new(AttnUNet::new(vs, *config)?)),
            ModelKind::CropUNet(config) => Ok(Box::new(CropUNet::new(vs, config.clone())?)),
        }
    }
}
