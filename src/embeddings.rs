//! Sinusoidal timestep embeddings.
//!
//! Each diffusion timestep is mapped to a fixed feature vector made of sine
//! and cosine waves at geometrically spaced frequencies, the same encoding
//! transformers use for token positions.
use tch::{nn::Module, Kind, Tensor};

/// Embeds a batch of timesteps of shape `(batch,)` into `(batch, dims)`.
///
/// The frequencies decay as `exp(-ln(10000) / (dims / 2 - 1) * i)` for
/// `i in 0..dims / 2`; the sine half comes first, then the cosine half.
/// `dims` must be even and at least 4.
pub fn timestep_embedding(timesteps: &Tensor, dims: i64) -> Tensor {
    let half_dim = dims / 2;
    let rate = f64::ln(10000.) / (half_dim - 1) as f64;
    let freqs = (Tensor::arange(half_dim, (Kind::Float, timesteps.device())) * -rate).exp();
    let emb = timesteps.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
    Tensor::cat(&[emb.sin(), emb.cos()], -1)
}

/// Parameter-free module wrapper around [`timestep_embedding`].
#[derive(Debug, Clone, Copy)]
pub struct Timesteps {
    dims: i64,
}

impl Timesteps {
    pub fn new(dims: i64) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> i64 {
        self.dims
    }
}

impl Module for Timesteps {
    fn forward(&self, xs: &Tensor) -> Tensor {
        timestep_embedding(xs, self.dims)
    }
}
