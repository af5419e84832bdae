//! 計算デバイスの選択
//!
//! `DeviceType::Auto` は起動時に1回だけ WGPU アダプタを確認し、
//! 使えなければ CPU (NdArray) にフォールバックします。

use burn::tensor::Tensor;
use burn_wgpu::WgpuDevice;

use crate::ml::WgpuBackend;
use crate::model::DeviceType;

/// 実際に使用するバックエンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Wgpu,
    Cpu,
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::Wgpu => write!(f, "WGPU (GPU)"),
            ComputeDevice::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// WGPU アダプタで小さなテンソルを作成・読み戻しできるか
///
/// アダプタが無い場合 burn-wgpu は初期化時に panic するため、それを捕捉する。
pub fn wgpu_available() -> bool {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));

    let result = std::panic::catch_unwind(|| {
        let device = WgpuDevice::default();
        Tensor::<WgpuBackend, 1>::from_floats([1.0], &device).into_data()
    });

    std::panic::set_hook(previous_hook);
    result.is_ok()
}

/// 設定値と検出関数から使用デバイスを決定
pub fn resolve_with(requested: DeviceType, detect: impl FnOnce() -> bool) -> ComputeDevice {
    match requested {
        DeviceType::Wgpu => ComputeDevice::Wgpu,
        DeviceType::Cpu => ComputeDevice::Cpu,
        DeviceType::Auto => {
            if detect() {
                ComputeDevice::Wgpu
            } else {
                tracing::warn!("WGPU アダプタが見つかりません。CPU で実行します");
                ComputeDevice::Cpu
            }
        }
    }
}

/// 使用デバイスを決定してログに出力
pub fn resolve_device(requested: DeviceType) -> ComputeDevice {
    let device = resolve_with(requested, wgpu_available);
    tracing::info!("使用デバイス: {} (設定: {})", device, requested);
    device
}
