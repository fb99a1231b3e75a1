//! Self-attention over the spatial positions of a feature map.
use tch::{nn, nn::Module, Kind, Tensor};

pub const DEFAULT_NUM_HEADS: i64 = 4;

#[derive(Debug)]
struct MultiHeadAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    num_heads: i64,
    head_dim: i64,
    scale: f64,
}

impl MultiHeadAttention {
    fn new(vs: nn::Path, channels: i64, num_heads: i64) -> Self {
        let head_dim = channels / num_heads;
        let c = Default::default();
        Self {
            q_proj: nn::linear(&vs / "q_proj", channels, channels, c),
            k_proj: nn::linear(&vs / "k_proj", channels, channels, c),
            v_proj: nn::linear(&vs / "v_proj", channels, channels, c),
            out_proj: nn::linear(&vs / "out_proj", channels, channels, c),
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        }
    }

    // (b, seq, c) -> (b, heads, seq, head_dim)
    fn split_heads(&self, xs: &Tensor, bsz: i64, seq_len: i64) -> Tensor {
        xs.view((bsz, seq_len, self.num_heads, self.head_dim)).transpose(1, 2)
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (bsz, seq_len, channels) = xs.size3().unwrap();
        let query = self.split_heads(&(xs.apply(&self.q_proj) * self.scale), bsz, seq_len);
        let key = self.split_heads(&xs.apply(&self.k_proj), bsz, seq_len);
        let value = self.split_heads(&xs.apply(&self.v_proj), bsz, seq_len);
        let weights = query.matmul(&key.transpose(-1, -2));
        let weights = weights.softmax(-1, Kind::Float).to_kind(value.kind());
        weights
            .matmul(&value)
            .transpose(1, 2)
            .reshape([bsz, seq_len, channels])
            .apply(&self.out_proj)
    }
}

/// Flattens a `(b, c, h, w)` feature map into `h * w` tokens of `c`
/// features, runs multi-head self-attention and a feed-forward layer, each
/// with a residual connection, and folds the tokens back.
///
/// The block is tied to the spatial resolution it was built for.
#[derive(Debug)]
pub struct AttentionBlock {
    proj_in: nn::Linear,
    attention: MultiHeadAttention,
    layer_norm: nn::LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
    channels: i64,
    resolution: i64,
}

impl AttentionBlock {
    pub fn new(vs: nn::Path, channels: i64, resolution: i64, num_heads: i64) -> Self {
        let c = Default::default();
        let proj_in = nn::linear(&vs / "proj_in", channels, channels, c);
        let attention = MultiHeadAttention::new(&vs / "attention", channels, num_heads);
        let layer_norm = nn::layer_norm(&vs / "layer_norm", vec![channels], Default::default());
        let ff1 = nn::linear(&vs / "ff1", channels, channels, c);
        let ff2 = nn::linear(&vs / "ff2", channels, channels, c);
        Self { proj_in, attention, layer_norm, ff1, ff2, channels, resolution }
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }
}

impl Module for AttentionBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (_, _, h, w) = xs.size4().unwrap();
        let res = self.resolution;
        assert!(
            h == res && w == res,
            "attention block built for {res}x{res} inputs, got {h}x{w}"
        );
        let seq_len = res * res;
        let xs = xs.reshape([-1, self.channels, seq_len]).transpose(1, 2);
        let xs = xs.apply(&self.proj_in).apply(&self.attention) + &xs;
        let hs = xs.apply(&self.layer_norm).apply(&self.ff1).relu().apply(&self.ff2);
        (hs + xs).transpose(1, 2).reshape([-1, self.channels, res, res])
    }
}
