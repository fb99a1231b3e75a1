//! Noise prediction networks.
//!
//! Both variants take a batch of noisy images `(b, c, h, w)` together with
//! their timesteps `(b,)` and predict the gaussian noise that was added.
use tch::Tensor;

pub mod attention;
pub mod attn_unet;
pub mod blocks;
pub mod crop_unet;

pub use attn_unet::{AttnUNet, AttnUNetConfig};
pub use crop_unet::{CropUNet, CropUNetConfig};

pub trait NoisePredictor: std::fmt::Debug {
    /// Predicts the noise present in `xs` at the given `timesteps`.
    fn predict_noise(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor;

    fn out_channels(&self) -> i64;
}
