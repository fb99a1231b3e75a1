//! Trains a small noise predictor on synthetic ellipse "scans" and samples a
//! few images from it.
use std::path::PathBuf;

use clap::Parser;
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

use oasis_ddpm::{
    model_kind::ModelKind,
    schedulers::{ddpm::DDPMScheduler, NoiseSchedule, NoiseScheduleConfig},
    train::{Trainer, TrainingConfig},
    unet::{AttnUNetConfig, CropUNetConfig},
    utils::{get_device, output_filename},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on the cpu rather than on an accelerator.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// TOML file describing the network, a small attention unet otherwise.
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// TOML file with the noise schedule, the linear one otherwise.
    #[arg(long)]
    schedule_config: Option<PathBuf>,

    /// Use the cropping unet instead of the attention one.
    #[arg(long)]
    crop_unet: bool,

    #[arg(long, default_value_t = 32)]
    image_size: i64,

    #[arg(long, default_value_t = 8)]
    batch_size: i64,

    #[arg(long, default_value_t = 16)]
    batches_per_epoch: usize,

    #[arg(long, default_value_t = 5)]
    epochs: usize,

    #[arg(long, default_value_t = 3e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 2)]
    num_samples: i64,

    #[arg(long, default_value = "sample.png")]
    final_image: String,

    /// Directory receiving the loss csv files and the samples.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long)]
    seed: Option<i64>,
}

/// White ellipses of random center and axes on a black background, scaled to
/// `[-1, 1]`.
fn synthetic_batch(bsize: i64, size: i64, device: Device) -> Tensor {
    let opts = (Kind::Float, device);
    let coords = Tensor::linspace(-1., 1., size, opts);
    let ys = coords.view([1, size, 1]);
    let xs = coords.view([1, 1, size]);
    let cx = Tensor::rand([bsize, 1, 1], opts) * 0.4 - 0.2;
    let cy = Tensor::rand([bsize, 1, 1], opts) * 0.4 - 0.2;
    let ax = Tensor::rand([bsize, 1, 1], opts) * 0.3 + 0.5;
    let ay = Tensor::rand([bsize, 1, 1], opts) * 0.3 + 0.5;
    let dist = ((&xs - &cx) / &ax).square() + ((&ys - &cy) / &ay).square();
    let mask = dist.le(1.).to_kind(Kind::Float);
    (mask * 2. - 1.).unsqueeze(1)
}

fn model_kind(args: &Args) -> anyhow::Result<ModelKind> {
    if let Some(path) = &args.model_config {
        return ModelKind::from_file(path);
    }
    let kind = if args.crop_unet {
        ModelKind::CropUNet(CropUNetConfig {
            channels: vec![16, 32, 64],
            time_embed_dim: 64,
            padding: 1,
            ..Default::default()
        })
    } else {
        ModelKind::AttnUNet(AttnUNetConfig {
            base_channels: 16,
            time_embed_dim: 64,
            image_size: args.image_size,
            max_attention_resolution: 16,
            ..Default::default()
        })
    };
    Ok(kind)
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Some(seed) = args.seed {
        tch::manual_seed(seed);
    }
    let device = if args.cpu { Device::Cpu } else { get_device() };
    info!(?device, "starting");

    let schedule_config = match &args.schedule_config {
        Some(path) => NoiseScheduleConfig::from_file(path)?,
        None => NoiseScheduleConfig::default(),
    };
    let schedule = NoiseSchedule::new(schedule_config, device);

    let kind = model_kind(&args)?;
    let vs = nn::VarStore::new(device);
    let model = kind.build(vs.root())?;
    let config = TrainingConfig { epochs: args.epochs, learning_rate: args.learning_rate };
    let mut trainer = Trainer::new(&vs, model, schedule, config)?;

    let batch = || synthetic_batch(args.batch_size, args.image_size, device);
    let train: Vec<Tensor> = (0..args.batches_per_epoch).map(|_| batch()).collect();
    let test: Vec<Tensor> = (0..args.batches_per_epoch.div_ceil(4)).map(|_| batch()).collect();
    let history = trainer.fit(&train, &test)?;

    std::fs::create_dir_all(&args.output_dir)?;
    history.save(&args.output_dir)?;

    let scheduler = DDPMScheduler::new(trainer.schedule())?;
    let shape = [args.num_samples, kind.in_channels(), args.image_size, args.image_size];
    let images = scheduler.sample(trainer.model(), &shape, device);
    let images = (images * 255.).to_kind(Kind::Uint8);
    for idx in 0..args.num_samples {
        let name = output_filename(&args.final_image, idx + 1, args.num_samples);
        let path = args.output_dir.join(name);
        tch::vision::image::save(&images.get(idx), &path)?;
        info!(path = %path.display(), "saved sample");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt::init();
        None
    };
    run(args)
}
