//! # Denoising Diffusion Probabilistic Models
//!
//! Ancestral sampling: starting from pure gaussian noise, each step removes
//! the noise predicted by the model and re-injects a smaller amount of fresh
//! noise, walking the schedule backwards down to timestep 1.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use super::{NoiseSchedule, Scheduler};
use crate::{error::Result, unet::NoisePredictor};

#[derive(Debug, Clone)]
pub struct DDPMScheduler {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl DDPMScheduler {
    pub fn new(schedule: &NoiseSchedule) -> Result<Self> {
        let to_vec = |t: &Tensor| Vec::<f64>::try_from(t.to_kind(Kind::Double));
        Ok(Self {
            betas: to_vec(schedule.schedule())?,
            alphas: to_vec(schedule.alphas())?,
            alphas_cumprod: to_vec(schedule.alphas_cumprod())?,
        })
    }

    /// Runs the full reverse chain for a batch of the given `shape` and maps
    /// the result from `[-1, 1]` to `[0, 1]`.
    pub fn sample(&self, model: &dyn NoisePredictor, shape: &[i64], device: Device) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let bsize = shape[0];
        let timesteps = self.timesteps();
        info!(steps = timesteps.len(), ?shape, "sampling");
        let mut xs = Tensor::randn(shape, (Kind::Float, device)) * self.init_noise_sigma();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let t = Tensor::full([bsize], timestep, (Kind::Int64, device));
            let noise_pred = model.predict_noise(&xs, &t);
            xs = self.step(&noise_pred, timestep, &xs);
            if index % 100 == 0 {
                debug!("timestep {}/{}", index + 1, timesteps.len());
            }
        }
        (xs.clamp(-1., 1.) + 1.) / 2.
    }
}

impl Scheduler for DDPMScheduler {
    fn timesteps(&self) -> Vec<i64> {
        (1..self.betas.len() as i64).rev().collect()
    }

    fn step(&self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Tensor {
        let t = timestep as usize;
        let alpha = self.alphas[t];
        let alpha_prod = self.alphas_cumprod[t];
        let beta = self.betas[t];
        let noise_coeff = (1. - alpha) / (1. - alpha_prod).sqrt();
        let mean = (sample - model_output * noise_coeff) / alpha.sqrt();
        if timestep > 1 {
            mean + sample.randn_like() * beta.sqrt()
        } else {
            mean
        }
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timestep: i64) -> Tensor {
        let alpha_prod = self.alphas_cumprod[timestep as usize];
        original_samples * alpha_prod.sqrt() + noise * (1. - alpha_prod).sqrt()
    }
}
