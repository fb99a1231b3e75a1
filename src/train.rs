//! Noise prediction training loop and loss bookkeeping.
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, OptimizerConfig},
    Reduction, Tensor,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DiffusionError, Result},
    schedulers::NoiseSchedule,
    unet::NoisePredictor,
    utils::has_nan,
};

pub const TRAIN_LOSS_FILE: &str = "Epoch Loss.csv";
pub const TEST_LOSS_FILE: &str = "Test Loss.csv";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self { epochs: 100, learning_rate: 3e-4 }
    }
}

impl TrainingConfig {
    pub fn from_file<T: AsRef<Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: TrainingConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

/// Corrupts `images` at random timesteps and returns the mean squared error
/// between the noise the model predicts and the noise actually added.
pub fn noise_prediction_loss(
    model: &dyn NoisePredictor,
    schedule: &NoiseSchedule,
    images: &Tensor,
) -> Result<Tensor> {
    let (bsize, _, _, _) = images.size4()?;
    let timesteps = schedule.sample_timesteps(bsize).to_device(images.device());
    let (noisy, noise) = schedule.corrupt(images, &timesteps)?;
    let predicted = model.predict_noise(&noisy, &timesteps);
    Ok(predicted.mse_loss(&noise, Reduction::Mean))
}

/// Batch losses of every epoch, one row per epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossHistory {
    pub train: Vec<Vec<f64>>,
    pub test: Vec<Vec<f64>>,
}

impl LossHistory {
    pub fn push_epoch(&mut self, train: Vec<f64>, test: Vec<f64>) {
        self.train.push(train);
        self.test.push(test);
    }

    pub fn epochs(&self) -> usize {
        self.train.len()
    }

    /// Writes both histories to `dir`, see [`save_loss_data`].
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        save_loss_data(dir, &self.train, &self.test)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn write_rows(path: &Path, rows: &[Vec<f64>]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path)?;
    for row in rows {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the training losses to `Epoch Loss.csv` and the test losses to
/// `Test Loss.csv` inside `dir`, one comma separated row per epoch and no
/// header. Existing files are overwritten.
pub fn save_loss_data<P: AsRef<Path>>(
    dir: P,
    tracked_loss: &[Vec<f64>],
    test_loss: &[Vec<f64>],
) -> Result<()> {
    let dir = dir.as_ref();
    write_rows(&dir.join(TRAIN_LOSS_FILE), tracked_loss)?;
    write_rows(&dir.join(TEST_LOSS_FILE), test_loss)?;
    debug!(dir = %dir.display(), epochs = tracked_loss.len(), "saved loss data");
    Ok(())
}

/// Trains a noise predictor with Adam, recording the loss of every batch.
pub struct Trainer {
    model: Box<dyn NoisePredictor>,
    schedule: NoiseSchedule,
    optimizer: nn::Optimizer,
    history: LossHistory,
    pub config: TrainingConfig,
}

impl Trainer {
    /// `vs` must be the variable store the model was built in.
    pub fn new(
        vs: &nn::VarStore,
        model: Box<dyn NoisePredictor>,
        schedule: NoiseSchedule,
        config: TrainingConfig,
    ) -> Result<Self> {
        if !(config.learning_rate > 0.) {
            return Err(DiffusionError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                config.learning_rate
            )));
        }
        let optimizer = nn::Adam::default().build(vs, config.learning_rate)?;
        Ok(Self { model, schedule, optimizer, history: LossHistory::default(), config })
    }

    pub fn model(&self) -> &dyn NoisePredictor {
        self.model.as_ref()
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// Runs one optimization step on a batch of images in `[-1, 1]` and
    /// returns its loss.
    pub fn train_step(&mut self, images: &Tensor) -> Result<f64> {
        let loss = noise_prediction_loss(self.model.as_ref(), &self.schedule, images)?;
        if has_nan(&loss) {
            warn!("nan loss, skipping the optimizer step");
        } else {
            self.optimizer.backward_step(&loss);
        }
        Ok(loss.double_value(&[]))
    }

    /// Computes the loss of a batch without tracking gradients.
    pub fn evaluate(&self, images: &Tensor) -> Result<f64> {
        let loss = tch::no_grad(|| {
            noise_prediction_loss(self.model.as_ref(), &self.schedule, images)
        })?;
        Ok(loss.double_value(&[]))
    }

    /// Trains over every batch of `train`, evaluates every batch of `test` and
    /// appends both loss rows to the history. Returns the mean losses.
    pub fn train_epoch(&mut self, train: &[Tensor], test: &[Tensor]) -> Result<(f64, f64)> {
        let epoch = self.history.epochs() + 1;
        let train_losses =
            train.iter().map(|b| self.train_step(b)).collect::<Result<Vec<_>>>()?;
        let test_losses = test.iter().map(|b| self.evaluate(b)).collect::<Result<Vec<_>>>()?;
        let (train_loss, test_loss) = (mean(&train_losses), mean(&test_losses));
        info!(epoch, train_loss, test_loss, "epoch done");
        self.history.push_epoch(train_losses, test_losses);
        Ok((train_loss, test_loss))
    }

    /// Runs `config.epochs` epochs over the same batches.
    pub fn fit(&mut self, train: &[Tensor], test: &[Tensor]) -> Result<&LossHistory> {
        for _ in 0..self.config.epochs {
            self.train_epoch(train, test)?;
        }
        Ok(&self.history)
    }
}
