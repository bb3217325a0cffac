//! thermompnn-nn
//!
//! Candle implementation of the ProteinMPNN graph network used by ThermoMPNN:
//! k-nearest-neighbour structure graphs, standard and invariant-point message passing,
//! random-order autoregressive decoding and single-residue-recovery scoring.
//!
//! Weights are read through a [`candle_nn::VarBuilder`] using the PyTorch parameter names, so
//! a converted checkpoint maps on directly.
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Result};

pub use proteinmpnn::configs::{ProteinMPNNConfig, SampleOptions};
pub use proteinmpnn::model::{ProteinInputs, ProteinMPNN, SampleOutput};

pub mod proteinmpnn;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            log::info!("running on CPU, build with `--features metal` to use the GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            log::info!("running on CPU");
        }
        Ok(Device::Cpu)
    }
}
