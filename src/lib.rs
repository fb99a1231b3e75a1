pub mod embeddings;
pub mod error;
pub mod model_kind;
pub mod schedulers;
pub mod train;
pub mod unet;
pub mod utils;
