use tch::{Device, Kind, Tensor};

/// Picks the accelerator to run on: MPS, then CUDA, falling back to the CPU.
pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Builds the file name of the `sample_idx`-th generated image, the index
/// being inserted before the extension when more than one image is sampled.
pub fn output_filename(basename: &str, sample_idx: i64, num_samples: i64) -> String {
    if num_samples <= 1 {
        return basename.to_string();
    }
    match basename.rsplit_once('.') {
        None => format!("{basename}.{sample_idx}.png"),
        Some((stem, extension)) => format!("{stem}.{sample_idx}.{extension}"),
    }
}

pub fn count_nan(xs: &Tensor) -> i64 {
    xs.isnan().sum(Kind::Int64).int64_value(&[])
}

pub fn has_nan(xs: &Tensor) -> bool {
    count_nan(xs) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_filename() {
        assert_eq!(output_filename("sample.png", 0, 1), "sample.png");
        assert_eq!(output_filename("sample.png", 2, 4), "sample.2.png");
        assert_eq!(output_filename("sample", 1, 2), "sample.1.png");
    }

    #[test]
    fn test_nan_detection() {
        let xs = Tensor::from_slice(&[1f32, f32::NAN, 3., f32::NAN]);
        assert!(has_nan(&xs));
        assert_eq!(count_nan(&xs), 2);
        let ys = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        assert!(!has_nan(&ys));
        assert_eq!(count_nan(&ys), 0);
    }
}
