//! Classic UNet with transposed-convolution upsampling and center-cropped
//! skip connections, conditioned on the timestep at every level.
use std::fs;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Tensor};
use tracing::debug;

use super::{blocks::center_crop, NoisePredictor};
use crate::{
    embeddings::Timesteps,
    error::{DiffusionError, Result},
};

/// Two 3x3 convolutions with ReLUs, the projected timestep embedding being
/// added to the features between them.
#[derive(Debug)]
pub struct TimeConvReluBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    time_proj: nn::Linear,
}

impl TimeConvReluBlock {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: i64,
        padding: i64,
    ) -> Self {
        let conv_cfg = nn::ConvConfig { padding, ..Default::default() };
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let time_proj =
            nn::linear(&vs / "time_proj", temb_channels, out_channels, Default::default());
        Self { conv1, conv2, time_proj }
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Tensor {
        let temb = temb.apply(&self.time_proj).relu().unsqueeze(-1).unsqueeze(-1);
        (xs.apply(&self.conv1).relu() + temb).apply(&self.conv2).relu()
    }
}

#[derive(Debug)]
pub struct Encoder {
    blocks: Vec<TimeConvReluBlock>,
}

impl Encoder {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        channels: &[i64],
        temb_channels: i64,
        padding: i64,
    ) -> Self {
        let mut blocks = vec![];
        let mut c_in = in_channels;
        for (index, &c_out) in channels.iter().enumerate() {
            blocks.push(TimeConvReluBlock::new(&vs / index, c_in, c_out, temb_channels, padding));
            c_in = c_out;
        }
        Self { blocks }
    }

    /// Returns the output of every level before pooling, highest resolution
    /// first.
    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Vec<Tensor> {
        let mut features: Vec<Tensor> = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            let ys = match features.last() {
                None => block.forward(xs, temb),
                Some(prev) => block.forward(&prev.max_pool2d_default(2), temb),
            };
            features.push(ys);
        }
        features
    }
}

#[derive(Debug)]
pub struct Decoder {
    upconvs: Vec<nn::ConvTranspose2D>,
    blocks: Vec<TimeConvReluBlock>,
}

impl Decoder {
    /// `channels` lists the level widths from the bottom of the network up.
    pub fn new(vs: nn::Path, channels: &[i64], temb_channels: i64, padding: i64) -> Self {
        let vs_up = &vs / "upconvs";
        let vs_blocks = &vs / "blocks";
        let up_cfg = nn::ConvTransposeConfig { stride: 2, ..Default::default() };
        let mut upconvs = vec![];
        let mut blocks = vec![];
        for (index, pair) in channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            upconvs.push(nn::conv_transpose2d(&vs_up / index, c_in, c_out, 2, up_cfg));
            blocks.push(TimeConvReluBlock::new(
                &vs_blocks / index,
                2 * c_out,
                c_out,
                temb_channels,
                padding,
            ));
        }
        Self { upconvs, blocks }
    }

    /// Upsamples `xs` level by level, fusing `skips` lowest resolution first.
    pub fn forward(&self, xs: &Tensor, skips: &[Tensor], temb: &Tensor) -> Tensor {
        assert_eq!(
            skips.len(),
            self.blocks.len(),
            "expected {} skip connections, got {}",
            self.blocks.len(),
            skips.len()
        );
        let mut xs = xs.shallow_clone();
        for ((upconv, block), skip) in self.upconvs.iter().zip(self.blocks.iter()).zip(skips) {
            let ys = xs.apply(upconv);
            let (_, _, h, w) = ys.size4().unwrap();
            let skip = center_crop(skip, h, w);
            xs = block.forward(&Tensor::cat(&[ys, skip], 1), temb);
        }
        xs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropUNetConfig {
    pub in_channels: i64,
    pub out_channels: i64,
    /// Level widths, highest resolution first.
    pub channels: Vec<i64>,
    pub time_embed_dim: i64,
    /// Padding of the 3x3 convolutions, 0 shrinks every level by 4 pixels.
    pub padding: i64,
    /// Resize the prediction back to the input resolution.
    pub retain_dim: bool,
}

impl Default for CropUNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            channels: vec![64, 128, 256, 512, 1024],
            time_embed_dim: 256,
            padding: 0,
            retain_dim: true,
        }
    }
}

impl CropUNetConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: CropUNetConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DiffusionError::InvalidConfig(msg));
        if self.in_channels <= 0 || self.out_channels <= 0 {
            return invalid(format!(
                "channel counts must be positive, got {} in and {} out",
                self.in_channels, self.out_channels
            ));
        }
        if self.channels.len() < 2 || self.channels.iter().any(|&c| c <= 0) {
            return invalid(format!(
                "channels needs at least two positive widths, got {:?}",
                self.channels
            ));
        }
        if self.time_embed_dim < 4 || self.time_embed_dim % 2 != 0 {
            return invalid(format!(
                "time_embed_dim must be even and at least 4, got {}",
                self.time_embed_dim
            ));
        }
        if !(0..=1).contains(&self.padding) {
            return invalid(format!("padding must be 0 or 1, got {}", self.padding));
        }
        Ok(())
    }

    /// Side of the head output for a square input of side `size`, before any
    /// resizing. Returns `None` when the input is too small for the network.
    pub fn output_size(&self, size: i64) -> Option<i64> {
        let shrink = 4 * (1 - self.padding);
        let levels = self.channels.len();
        let mut sizes = Vec::with_capacity(levels);
        let mut side = size;
        for level in 0..levels {
            if level > 0 {
                side /= 2;
            }
            side -= shrink;
            if side <= 0 {
                return None;
            }
            sizes.push(side);
        }
        for skip in sizes.iter().rev().skip(1) {
            side = 2 * side - shrink;
            if side <= 0 || side + shrink > *skip {
                return None;
            }
        }
        Some(side)
    }
}

#[derive(Debug)]
pub struct CropUNet {
    time_proj: Timesteps,
    encoder: Encoder,
    decoder: Decoder,
    head: nn::Conv2D,
    pub config: CropUNetConfig,
}

impl CropUNet {
    pub fn new(vs: nn::Path, config: CropUNetConfig) -> Result<Self> {
        config.validate()?;
        let temb = config.time_embed_dim;
        let time_proj = Timesteps::new(temb);
        let encoder = Encoder::new(
            &vs / "encoder",
            config.in_channels,
            &config.channels,
            temb,
            config.padding,
        );
        let rev_channels: Vec<i64> = config.channels.iter().rev().copied().collect();
        let decoder = Decoder::new(&vs / "decoder", &rev_channels, temb, config.padding);
        let head =
            nn::conv2d(&vs / "head", config.channels[0], config.out_channels, 1, Default::default());
        debug!(channels = ?config.channels, padding = config.padding, "built crop unet");
        Ok(Self { time_proj, encoder, decoder, head, config })
    }

    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let temb = self.time_proj.forward(&timesteps.to_device(xs.device())).to_kind(xs.kind());
        let mut features = self.encoder.forward(xs, &temb);
        features.reverse();
        let ys = self.decoder.forward(&features[0], &features[1..], &temb).apply(&self.head);
        if !self.config.retain_dim {
            return ys;
        }
        let (_, _, h, w) = xs.size4().unwrap();
        if ys.size()[2..] == [h, w] {
            ys
        } else {
            ys.upsample_bilinear2d([h, w], false, None::<f64>, None::<f64>)
        }
    }
}

impl NoisePredictor for CropUNet {
    fn predict_noise(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        self.forward(xs, timesteps)
    }

    fn out_channels(&self) -> i64 {
        self.config.out_channels
    }
}
