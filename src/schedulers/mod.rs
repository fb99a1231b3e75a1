//! Noise schedules and the forward diffusion process.
//!
//! A schedule fixes the variance `beta_t` of the gaussian noise added at each
//! training step. Images are corrupted in closed form through the cumulative
//! product of `1 - beta_t`, so any timestep can be reached in one shot.
use std::fs;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};

pub mod ddpm;
pub mod types;

pub use types::Scheduler;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: i64, max_beta: f64) -> Tensor {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    let n = num_diffusion_timesteps as f64;
    let betas: Vec<f64> = (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect();
    Tensor::from_slice(&betas)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseScheduleConfig {
    /// The value of beta at the first timestep.
    pub beta_start: f64,
    /// The value of beta at the last timestep.
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: i64,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: 1e-4,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 1000,
        }
    }
}

impl NoiseScheduleConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: NoiseScheduleConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

/// Precomputed variance schedule, shared read-only by every noising and
/// sampling call.
#[derive(Debug)]
pub struct NoiseSchedule {
    betas: Tensor,
    alphas: Tensor,
    alphas_cumprod: Tensor,
    device: Device,
    pub config: NoiseScheduleConfig,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig, device: Device) -> Self {
        let n = config.train_timesteps;
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_start, config.beta_end, n, (Kind::Double, device))
            }
            BetaSchedule::ScaledLinear => Tensor::linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                n,
                (Kind::Double, device),
            )
            .square(),
            BetaSchedule::SquaredcosCapV2 => {
                betas_for_alpha_bar(n, 0.999).to_kind(Kind::Double).to_device(device)
            }
        };
        let alphas: Tensor = 1.0 - &betas;
        let alphas_cumprod = alphas.cumprod(0, Kind::Double);
        Self { betas, alphas, alphas_cumprod, device, config }
    }

    /// The linear schedule from 1e-4 to 0.02 over 1000 steps.
    pub fn linear(device: Device) -> Self {
        Self::new(NoiseScheduleConfig::default(), device)
    }

    /// Number of timesteps in the schedule.
    pub fn len(&self) -> i64 {
        self.config.train_timesteps
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// The beta values, one per timestep.
    pub fn schedule(&self) -> &Tensor {
        &self.betas
    }

    pub fn alphas(&self) -> &Tensor {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    /// Draws `n` timesteps uniformly from `[1, len)`.
    pub fn sample_timesteps(&self, n: i64) -> Tensor {
        Tensor::randint_low(1, self.len(), [n], (Kind::Int64, self.device))
    }

    /// Noises `image` up to `timesteps`, returning the noisy image together
    /// with the standard normal noise that was used.
    ///
    /// `timesteps` holds one index per batch element. Indices outside of the
    /// schedule are rejected rather than clamped.
    pub fn corrupt(&self, image: &Tensor, timesteps: &Tensor) -> Result<(Tensor, Tensor)> {
        let noise = image.randn_like();
        let noisy = self.corrupt_with_noise(image, timesteps, &noise)?;
        Ok((noisy, noise))
    }

    /// Same as [`NoiseSchedule::corrupt`] with caller supplied noise.
    pub fn corrupt_with_noise(
        &self,
        image: &Tensor,
        timesteps: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        let timesteps = self.check_timesteps(timesteps)?;
        let alphas_cumprod = self.alphas_cumprod.index_select(0, &timesteps);
        let sqrt_alpha_prod = broadcast_to_image(&alphas_cumprod.sqrt(), image);
        let sqrt_one_minus_alpha_prod = broadcast_to_image(&(1.0f64 - &alphas_cumprod).sqrt(), image);
        Ok(sqrt_alpha_prod * image + sqrt_one_minus_alpha_prod * noise)
    }

    fn check_timesteps(&self, timesteps: &Tensor) -> Result<Tensor> {
        match timesteps.kind() {
            Kind::Uint8 | Kind::Int8 | Kind::Int16 | Kind::Int | Kind::Int64 => {}
            kind => return Err(DiffusionError::NonIntegerTimesteps(kind)),
        }
        let timesteps = timesteps.to_kind(Kind::Int64).to_device(self.device).flatten(0, -1);
        if timesteps.numel() == 0 {
            return Ok(timesteps);
        }
        let len = self.len();
        let min = timesteps.min().f_int64_value(&[])?;
        if min < 0 {
            return Err(DiffusionError::TimestepOutOfRange { timestep: min, len });
        }
        let max = timesteps.max().f_int64_value(&[])?;
        if max >= len {
            return Err(DiffusionError::TimestepOutOfRange { timestep: max, len });
        }
        Ok(timesteps)
    }
}

/// Reshapes per-sample coefficients `(batch,)` so they broadcast over the
/// remaining dimensions of `image`, converted to its kind and device.
fn broadcast_to_image(coeffs: &Tensor, image: &Tensor) -> Tensor {
    let mut shape = vec![-1i64];
    shape.resize(image.dim().max(1), 1);
    coeffs.to_kind(image.kind()).to_device(image.device()).view(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_vec(t: &Tensor) -> Vec<f64> {
        Vec::<f64>::try_from(t.to_kind(Kind::Double)).unwrap()
    }

    #[test]
    fn test_load_linear_config() {
        let cfg = NoiseScheduleConfig::from_file("src/schedulers/config.linear.default.toml").unwrap();
        assert_eq!(cfg, NoiseScheduleConfig::default());
    }

    #[test]
    fn test_linear_schedule() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let betas = to_vec(schedule.schedule());
        assert_eq!(betas.len(), 1000);
        assert_eq!(schedule.len(), 1000);
        for beta in betas.iter() {
            assert!(*beta >= 1e-4 - 1e-12 && *beta <= 0.02 + 1e-12, "beta {beta} out of bounds");
        }
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
        assert!(betas.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_alphas_cumprod() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let betas = to_vec(schedule.schedule());
        let alphas_cumprod = to_vec(schedule.alphas_cumprod());
        assert_eq!(alphas_cumprod.len(), 1000);
        assert!((alphas_cumprod[0] - (1. - betas[0])).abs() < 1e-9);
        assert!(alphas_cumprod.windows(2).all(|w| w[0] >= w[1]));
        assert!(alphas_cumprod[999] > 0. && alphas_cumprod[999] < 1e-3);
    }

    #[test]
    fn test_other_schedules_are_monotonic() {
        for beta_schedule in [BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2] {
            let cfg = NoiseScheduleConfig { beta_schedule, ..Default::default() };
            let schedule = NoiseSchedule::new(cfg, Device::Cpu);
            let alphas_cumprod = to_vec(schedule.alphas_cumprod());
            assert_eq!(alphas_cumprod.len(), 1000);
            assert!(alphas_cumprod.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_corrupt_shape() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let image = Tensor::rand([3, 1, 16, 16], (Kind::Float, Device::Cpu));
        let timesteps = Tensor::from_slice(&[1i64, 500, 999]);
        let (noisy, noise) = schedule.corrupt(&image, &timesteps).unwrap();
        assert_eq!(noisy.size(), image.size());
        assert_eq!(noise.size(), image.size());
        assert_eq!(noisy.kind(), Kind::Float);
    }

    #[test]
    fn test_corrupt_endpoints() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let image = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu)) * 2. - 1.;
        let noise = image.randn_like();

        let early = Tensor::from_slice(&[0i64, 0]);
        let noisy = schedule.corrupt_with_noise(&image, &early, &noise).unwrap();
        let diff = (&noisy - &image).abs().max().double_value(&[]);
        assert!(diff < 0.1, "image moved by {diff} at t=0");

        let late = Tensor::from_slice(&[999i64, 999]);
        let noisy = schedule.corrupt_with_noise(&image, &late, &noise).unwrap();
        let diff = (&noisy - &noise).abs().max().double_value(&[]);
        assert!(diff < 0.05, "noisy image is {diff} away from the noise at t=999");
    }

    #[test]
    fn test_corrupt_matches_formula() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let image = Tensor::ones([1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let noise = Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[250i64]);
        let noisy = schedule.corrupt_with_noise(&image, &t, &noise).unwrap();
        let expected = schedule.alphas_cumprod().double_value(&[250]).sqrt();
        assert!((noisy.double_value(&[0, 0, 1, 1]) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_corrupt_rejects_out_of_range() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let image = Tensor::zeros([2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[3i64, 1000]);
        match schedule.corrupt(&image, &t) {
            Err(DiffusionError::TimestepOutOfRange { timestep, len }) => {
                assert_eq!(timestep, 1000);
                assert_eq!(len, 1000);
            }
            other => panic!("unexpected result {other:?}"),
        }
        let t = Tensor::from_slice(&[-1i64, 4]);
        assert!(schedule.corrupt(&image, &t).is_err());
    }

    #[test]
    fn test_corrupt_rejects_float_timesteps() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let image = Tensor::zeros([1, 1, 4, 4], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[999.7f64]);
        assert!(matches!(
            schedule.corrupt(&image, &t),
            Err(DiffusionError::NonIntegerTimesteps(Kind::Double))
        ));
        let t = Tensor::from_slice(&[999i32]);
        assert!(schedule.corrupt(&image, &t).is_ok());
    }

    #[test]
    fn test_sample_timesteps() {
        let schedule = NoiseSchedule::linear(Device::Cpu);
        let t = schedule.sample_timesteps(4096);
        assert_eq!(t.size(), vec![4096]);
        assert_eq!(t.kind(), Kind::Int64);
        assert!(t.min().int64_value(&[]) >= 1);
        assert!(t.max().int64_value(&[]) < 1000);
    }
}
