//! Convolutional building blocks shared by the UNet variants.
use tch::{nn, nn::Module, Tensor};

/// Two 3x3 convolutions, each followed by a single-group GroupNorm, with a
/// ReLU in between. In residual mode the input is added back before a
/// final ReLU.
#[derive(Debug)]
pub struct ConvReluBlock {
    conv1: nn::Conv2D,
    norm1: nn::GroupNorm,
    conv2: nn::Conv2D,
    norm2: nn::GroupNorm,
    residual: bool,
}

impl ConvReluBlock {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        Self::build(vs, in_channels, out_channels, false)
    }

    /// Channel-preserving block whose output is `relu(x + block(x))`.
    pub fn residual(vs: nn::Path, channels: i64) -> Self {
        Self::build(vs, channels, channels, true)
    }

    fn build(vs: nn::Path, in_channels: i64, out_channels: i64, residual: bool) -> Self {
        let conv1_cfg = nn::ConvConfig { padding: 1, bias: false, ..Default::default() };
        let conv2_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv1_cfg);
        let norm1 = nn::group_norm(&vs / "norm1", 1, out_channels, Default::default());
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv2_cfg);
        let norm2 = nn::group_norm(&vs / "norm2", 1, out_channels, Default::default());
        Self { conv1, norm1, conv2, norm2, residual }
    }
}

impl Module for ConvReluBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let hs = xs
            .apply(&self.conv1)
            .apply(&self.norm1)
            .relu()
            .apply(&self.conv2)
            .apply(&self.norm2);
        if self.residual {
            (xs + hs).relu()
        } else {
            hs
        }
    }
}

/// Projects the timestep embedding to `channels` and reshapes it so that it
/// broadcasts over the spatial dimensions of a feature map.
fn project_embedding(temb: &Tensor, proj: &nn::Linear) -> Tensor {
    temb.relu().apply(proj).unsqueeze(-1).unsqueeze(-1)
}

/// Halves the resolution then refines the features.
#[derive(Debug)]
pub struct EncoderBlock {
    block1: ConvReluBlock,
    block2: ConvReluBlock,
    time_proj: nn::Linear,
}

impl EncoderBlock {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, temb_channels: i64) -> Self {
        let block1 = ConvReluBlock::residual(&vs / "block1", in_channels);
        let block2 = ConvReluBlock::new(&vs / "block2", in_channels, out_channels);
        let time_proj =
            nn::linear(&vs / "time_proj", temb_channels, out_channels, Default::default());
        Self { block1, block2, time_proj }
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Tensor {
        let xs = xs.max_pool2d_default(2).apply(&self.block1).apply(&self.block2);
        xs + project_embedding(temb, &self.time_proj)
    }
}

/// Doubles the resolution and fuses the matching encoder features.
#[derive(Debug)]
pub struct DecoderBlock {
    block1: ConvReluBlock,
    block2: ConvReluBlock,
    time_proj: nn::Linear,
}

impl DecoderBlock {
    /// `in_channels` counts the upsampled features and the skip together.
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, temb_channels: i64) -> Self {
        let block1 = ConvReluBlock::residual(&vs / "block1", in_channels);
        let block2 = ConvReluBlock::new(&vs / "block2", in_channels, out_channels);
        let time_proj =
            nn::linear(&vs / "time_proj", temb_channels, out_channels, Default::default());
        Self { block1, block2, time_proj }
    }

    pub fn forward(&self, xs: &Tensor, skip: &Tensor, temb: &Tensor) -> Tensor {
        let (_, _, h, w) = xs.size4().unwrap();
        let xs = xs.upsample_bilinear2d([2 * h, 2 * w], true, None::<f64>, None::<f64>);
        let skip = center_crop(skip, 2 * h, 2 * w);
        let xs = Tensor::cat(&[skip, xs], 1).apply(&self.block1).apply(&self.block2);
        xs + project_embedding(temb, &self.time_proj)
    }
}

/// Crops the center `height x width` window of a `(b, c, h, w)` feature map.
///
/// Panics when the feature map is smaller than the requested window, this
/// means encoder and decoder resolutions went out of sync.
pub fn center_crop(xs: &Tensor, height: i64, width: i64) -> Tensor {
    let (_, _, h, w) = xs.size4().unwrap();
    assert!(
        h >= height && w >= width,
        "cannot center crop a {h}x{w} feature map to {height}x{width}"
    );
    let top = (h - height) / 2;
    let left = (w - width) / 2;
    xs.narrow(2, top, height).narrow(3, left, width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn temb(bsize: i64) -> Tensor {
        Tensor::randn([bsize, 16], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_conv_relu_block_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ConvReluBlock::new(vs.root(), 3, 8);
        let xs = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&block).size(), vec![2, 8, 16, 16]);

        let block = ConvReluBlock::residual(vs.root() / "res", 8);
        let xs = Tensor::randn([2, 8, 16, 16], (Kind::Float, Device::Cpu));
        let ys = xs.apply(&block);
        assert_eq!(ys.size(), vec![2, 8, 16, 16]);
        assert!(ys.min().double_value(&[]) >= 0.);
    }

    #[test]
    fn test_conv_relu_block_biases() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _block = ConvReluBlock::new(vs.root() / "block", 3, 8);
        let variables = vs.variables();
        assert!(!variables.contains_key("block.conv1.bias"));
        assert_eq!(variables["block.conv2.bias"].size(), vec![8]);
    }

    #[test]
    fn test_encoder_block_halves_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = EncoderBlock::new(vs.root(), 4, 8, 16);
        let xs = Tensor::randn([2, 4, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &temb(2)).size(), vec![2, 8, 8, 8]);
    }

    #[test]
    fn test_decoder_block_doubles_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = DecoderBlock::new(vs.root(), 8, 4, 16);
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        let skip = Tensor::randn([2, 4, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &skip, &temb(2)).size(), vec![2, 4, 16, 16]);
    }

    #[test]
    fn test_decoder_block_crops_larger_skip() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = DecoderBlock::new(vs.root(), 8, 4, 16);
        let xs = Tensor::randn([1, 4, 8, 8], (Kind::Float, Device::Cpu));
        let skip = Tensor::randn([1, 4, 17, 17], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &skip, &temb(1)).size(), vec![1, 4, 16, 16]);
    }

    #[test]
    fn test_center_crop_window() {
        let xs = Tensor::arange(36, (Kind::Int64, Device::Cpu)).view([1, 1, 6, 6]);
        let cropped = center_crop(&xs, 2, 2);
        assert_eq!(cropped.size(), vec![1, 1, 2, 2]);
        assert_eq!(Vec::<i64>::try_from(cropped.flatten(0, -1)).unwrap(), vec![14, 15, 20, 21]);
    }

    #[test]
    #[should_panic(expected = "cannot center crop")]
    fn test_center_crop_rejects_smaller_input() {
        let xs = Tensor::zeros([1, 1, 4, 4], (Kind::Float, Device::Cpu));
        center_crop(&xs, 8, 8);
    }
}
