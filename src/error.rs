use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffusionError {
    /// A timestep index fell outside of the noise schedule.
    #[error("timestep {timestep} is out of range, the schedule has {len} steps")]
    TimestepOutOfRange { timestep: i64, len: i64 },

    /// Timesteps index the schedule and must be integers.
    #[error("timesteps must be an integer tensor, got {0:?}")]
    NonIntegerTimesteps(tch::Kind),

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
