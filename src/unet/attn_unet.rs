//! UNet with residual conv blocks, bilinear upsampling and spatial
//! self-attention on the low resolution levels.
use std::fs;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Tensor};
use tracing::debug;

use super::{
    attention::{AttentionBlock, DEFAULT_NUM_HEADS},
    blocks::{ConvReluBlock, DecoderBlock, EncoderBlock},
    NoisePredictor,
};
use crate::{
    embeddings::Timesteps,
    error::{DiffusionError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttnUNetConfig {
    pub in_channels: i64,
    pub out_channels: i64,
    /// Width of the first level, deeper levels use multiples of it.
    pub base_channels: i64,
    pub time_embed_dim: i64,
    /// Side of the square images the attention blocks are built for.
    pub image_size: i64,
    pub attention_heads: i64,
    /// Attention is only applied on levels whose side is at most this.
    pub max_attention_resolution: i64,
}

impl Default for AttnUNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            base_channels: 64,
            time_embed_dim: 256,
            image_size: 256,
            attention_heads: DEFAULT_NUM_HEADS,
            max_attention_resolution: 32,
        }
    }
}

impl AttnUNetConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: AttnUNetConfig = toml::from_str(&file)?;
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
        if self.time_embed_dim < 4 || self.time_embed_dim % 2 != 0 {
            return invalid(format!(
                "time_embed_dim must be even and at least 4, got {}",
                self.time_embed_dim
            ));
        }
        if self.attention_heads <= 0
            || self.base_channels <= 0
            || self.base_channels % self.attention_heads != 0
        {
            return invalid(format!(
                "base_channels {} is not divisible by {} attention heads",
                self.base_channels, self.attention_heads
            ));
        }
        if self.image_size <= 0 || self.image_size % 8 != 0 {
            return invalid(format!(
                "image_size must be a positive multiple of 8, got {}",
                self.image_size
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AttnUNet {
    time_proj: Timesteps,
    in_layer: ConvReluBlock,
    down_blocks: Vec<(EncoderBlock, Option<AttentionBlock>)>,
    bottleneck: Vec<ConvReluBlock>,
    up_blocks: Vec<(DecoderBlock, Option<AttentionBlock>)>,
    out_layer: nn::Conv2D,
    pub config: AttnUNetConfig,
}

impl AttnUNet {
    pub fn new(vs: nn::Path, config: AttnUNetConfig) -> Result<Self> {
        config.validate()?;
        let m = config.base_channels;
        let temb = config.time_embed_dim;
        let attention = |vs: nn::Path, channels: i64, resolution: i64| {
            (resolution <= config.max_attention_resolution)
                .then(|| AttentionBlock::new(vs, channels, resolution, config.attention_heads))
        };

        let time_proj = Timesteps::new(temb);
        let in_layer = ConvReluBlock::new(&vs / "in_layer", config.in_channels, m);

        let vs_down = &vs / "down_blocks";
        let mut down_blocks = vec![];
        let mut resolution = config.image_size;
        for (index, (c_in, c_out)) in
            [(m, 2 * m), (2 * m, 4 * m), (4 * m, 4 * m)].into_iter().enumerate()
        {
            resolution /= 2;
            let vs = &vs_down / index;
            let block = EncoderBlock::new(&vs / "block", c_in, c_out, temb);
            down_blocks.push((block, attention(&vs / "attention", c_out, resolution)));
        }

        let vs_mid = &vs / "bottleneck";
        let bottleneck = vec![
            ConvReluBlock::new(&vs_mid / 0, 4 * m, 8 * m),
            ConvReluBlock::new(&vs_mid / 1, 8 * m, 8 * m),
            ConvReluBlock::new(&vs_mid / 2, 8 * m, 4 * m),
        ];

        let vs_up = &vs / "up_blocks";
        let mut up_blocks = vec![];
        for (index, (c_in, c_out)) in [(8 * m, 2 * m), (4 * m, m), (2 * m, m)].into_iter().enumerate() {
            resolution *= 2;
            let vs = &vs_up / index;
            let block = DecoderBlock::new(&vs / "block", c_in, c_out, temb);
            up_blocks.push((block, attention(&vs / "attention", c_out, resolution)));
        }

        let out_layer =
            nn::conv2d(&vs / "out_layer", m, config.out_channels, 1, Default::default());
        let attention_levels = down_blocks
            .iter()
            .map(|(_, a)| a)
            .chain(up_blocks.iter().map(|(_, a)| a))
            .filter(|a| a.is_some())
            .count();
        debug!(base_channels = m, attention_levels, "built attention unet");
        Ok(Self { time_proj, in_layer, down_blocks, bottleneck, up_blocks, out_layer, config })
    }

    /// Runs the contracting path. Returns the feature maps of every level,
    /// highest resolution first, the last one having gone through the
    /// bottleneck.
    pub fn encode(&self, xs: &Tensor, temb: &Tensor) -> Vec<Tensor> {
        let mut xs = xs.apply(&self.in_layer);
        let mut features = Vec::with_capacity(self.down_blocks.len() + 1);
        for (block, attention) in self.down_blocks.iter() {
            let ys = apply_opt(block.forward(&xs, temb), attention);
            features.push(xs);
            xs = ys;
        }
        for block in self.bottleneck.iter() {
            xs = xs.apply(block);
        }
        features.push(xs);
        features
    }

    /// Runs the expanding path from `xs`, consuming `skips` lowest resolution
    /// first.
    pub fn decode(&self, xs: &Tensor, skips: &[Tensor], temb: &Tensor) -> Tensor {
        assert_eq!(
            skips.len(),
            self.up_blocks.len(),
            "expected {} skip connections, got {}",
            self.up_blocks.len(),
            skips.len()
        );
        let mut xs = xs.shallow_clone();
        for ((block, attention), skip) in self.up_blocks.iter().zip(skips.iter()) {
            xs = apply_opt(block.forward(&xs, skip, temb), attention);
        }
        xs
    }

    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let (_, _, h, w) = xs.size4().unwrap();
        let size = self.config.image_size;
        assert!(h == size && w == size, "unet built for {size}x{size} images, got {h}x{w}");
        let temb = self.time_proj.forward(&timesteps.to_device(xs.device())).to_kind(xs.kind());
        let mut features = self.encode(xs, &temb);
        features.reverse();
        self.decode(&features[0], &features[1..], &temb).apply(&self.out_layer)
    }
}

fn apply_opt(xs: Tensor, attention: &Option<AttentionBlock>) -> Tensor {
    match attention {
        Some(attention) => xs.apply(attention),
        None => xs,
    }
}

impl NoisePredictor for AttnUNet {
    fn predict_noise(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        self.forward(xs, timesteps)
    }

    fn out_channels(&self) -> i64 {
        self.config.out_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn small_config(image_size: i64) -> AttnUNetConfig {
        AttnUNetConfig {
            base_channels: 8,
            time_embed_dim: 32,
            image_size,
            max_attention_resolution: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_config_from_file() {
        let cfg = AttnUNetConfig::from_file("src/unet/config.attn_unet.default.toml").unwrap();
        assert_eq!(cfg, AttnUNetConfig::default());
    }

    #[test]
    fn test_forward_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(32)).unwrap();
        let xs = Tensor::randn([2, 1, 32, 32], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1i64, 500]);
        assert_eq!(unet.predict_noise(&xs, &t).size(), vec![2, 1, 32, 32]);
    }

    #[test]
    fn test_forward_full_size_mri() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(256)).unwrap();
        let xs = Tensor::randn([2, 1, 256, 256], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[10i64, 999]);
        let ys = tch::no_grad(|| unet.predict_noise(&xs, &t));
        assert_eq!(ys.size(), vec![2, 1, 256, 256]);
    }

    #[test]
    fn test_encode_levels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(32)).unwrap();
        let xs = Tensor::randn([1, 1, 32, 32], (Kind::Float, Device::Cpu));
        let temb = Tensor::randn([1, 32], (Kind::Float, Device::Cpu));
        let sizes: Vec<Vec<i64>> = unet.encode(&xs, &temb).iter().map(|f| f.size()).collect();
        assert_eq!(
            sizes,
            vec![vec![1, 8, 32, 32], vec![1, 16, 16, 16], vec![1, 32, 8, 8], vec![1, 32, 4, 4]]
        );
    }

    #[test]
    fn test_attention_levels_follow_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(32)).unwrap();
        let down: Vec<bool> = unet.down_blocks.iter().map(|(_, a)| a.is_some()).collect();
        let up: Vec<bool> = unet.up_blocks.iter().map(|(_, a)| a.is_some()).collect();
        assert_eq!(down, vec![true, true, true]);
        assert_eq!(up, vec![true, true, false]);
    }

    #[test]
    fn test_timestep_changes_output() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(16)).unwrap();
        let xs = Tensor::randn([1, 1, 16, 16], (Kind::Float, Device::Cpu));
        let a = unet.forward(&xs, &Tensor::from_slice(&[1i64]));
        let b = unet.forward(&xs, &Tensor::from_slice(&[900i64]));
        assert!(!a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    #[should_panic(expected = "unet built for 32x32 images, got 64x64")]
    fn test_forward_rejects_other_image_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(32)).unwrap();
        let xs = Tensor::randn([2, 1, 64, 64], (Kind::Float, Device::Cpu));
        unet.forward(&xs, &Tensor::from_slice(&[1i64, 2]));
    }

    #[test]
    fn test_default_config_accepts_full_size_slices() {
        let cfg = AttnUNetConfig::default();
        assert_eq!(cfg.image_size, 256);
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), AttnUNetConfig { base_channels: 4, ..cfg }).unwrap();
        let xs = Tensor::randn([2, 1, 256, 256], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1i64, 999]);
        let ys = tch::no_grad(|| unet.forward(&xs, &t));
        assert_eq!(ys.size(), vec![2, 1, 256, 256]);
    }

    #[test]
    #[should_panic(expected = "skip connections")]
    fn test_decode_rejects_wrong_skip_count() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = AttnUNet::new(vs.root(), small_config(16)).unwrap();
        let xs = Tensor::randn([1, 32, 2, 2], (Kind::Float, Device::Cpu));
        let temb = Tensor::randn([1, 32], (Kind::Float, Device::Cpu));
        unet.decode(&xs, &[], &temb);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        for cfg in [
            AttnUNetConfig { base_channels: 6, ..small_config(32) },
            AttnUNetConfig { time_embed_dim: 31, ..small_config(32) },
            AttnUNetConfig { image_size: 20, ..small_config(32) },
            AttnUNetConfig { in_channels: 0, ..small_config(32) },
        ] {
            let err = AttnUNet::new(vs.root(), cfg).unwrap_err();
            assert!(matches!(err, DiffusionError::InvalidConfig(_)), "{err}");
        }
    }
}
