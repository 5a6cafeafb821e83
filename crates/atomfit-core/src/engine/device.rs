use super::config::ConfigError;
use candle_core::Device;

const CPU_OPTIONS: [&str; 1] = ["cpu"];
const CUDA_OPTIONS: [&str; 2] = ["cuda", "gpu"];
const MULTI_GPU_OPTIONS: [&str; 4] = ["multiple_gpu", "multiple-gpu", "multi_gpu", "multi-gpu"];

/// Converts a user-provided device string into the devices to train on.
///
/// `cpu` gives the CPU, `cuda`/`gpu` the first CUDA device, and `multi-gpu`
/// (or one of its spellings) every CUDA device, of which there must be at
/// least two.
pub fn string_to_device(string: &str) -> Result<Vec<Device>, ConfigError> {
    let lower = string.to_lowercase();
    let unavailable = |reason: &str| ConfigError::InvalidValue {
        parameter: "device",
        reason: reason.to_string(),
    };

    if CPU_OPTIONS.contains(&lower.as_str()) {
        return Ok(vec![Device::Cpu]);
    }
    if CUDA_OPTIONS.contains(&lower.as_str()) {
        if !candle_core::utils::cuda_is_available() {
            return Err(unavailable(
                "CUDA is not available on this system, so the `cuda` option is not available",
            ));
        }
        return Device::new_cuda(0)
            .map(|d| vec![d])
            .map_err(|e| unavailable(&e.to_string()));
    }
    if MULTI_GPU_OPTIONS.contains(&lower.as_str()) {
        if !candle_core::utils::cuda_is_available() {
            return Err(unavailable(
                "No CUDA-capable GPUs were found, so the `multi-gpu` option is not available",
            ));
        }
        let devices: Vec<Device> = (0..)
            .map_while(|ordinal| Device::new_cuda(ordinal).ok())
            .collect();
        if devices.len() < 2 {
            return Err(unavailable(
                "Only one CUDA-capable GPU was found, so the `multi-gpu` option is not available",
            ));
        }
        return Ok(devices);
    }

    let valid: Vec<&str> = CPU_OPTIONS
        .iter()
        .chain(CUDA_OPTIONS.iter())
        .chain(MULTI_GPU_OPTIONS.iter())
        .copied()
        .collect();
    Err(unavailable(&format!(
        "unrecognized device string `{string}`, valid options are {valid:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_string_gives_cpu_device() {
        let devices = string_to_device("CPU").unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_cpu());
    }

    #[test]
    fn unknown_device_string_is_rejected() {
        assert!(matches!(
            string_to_device("tpu"),
            Err(ConfigError::InvalidValue {
                parameter: "device",
                ..
            })
        ));
    }
}
