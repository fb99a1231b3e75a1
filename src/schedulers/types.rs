use tch::Tensor;

/// A reverse-process sampler driven by a noise-predicting model.
pub trait Scheduler {
    /// Timesteps to visit during sampling, from the noisiest one down.
    fn timesteps(&self) -> Vec<i64>;
    /// Performs one denoising step given the predicted noise.
    fn step(&self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Tensor;
    fn init_noise_sigma(&self) -> f64;
    fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timestep: i64) -> Tensor;
}
