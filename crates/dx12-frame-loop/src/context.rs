use crate::backend::Backend;

/// Device-wide state created once at startup by the runtime setup and shared
/// read-only with every component that needs it.
pub struct GraphicsContext<B: Backend> {
    pub device: B::Device,
    pub adapter: AdapterInfo,
    /// Result of the one-time present-with-tearing capability query.
    pub tearing_supported: bool,
}

impl<B: Backend> GraphicsContext<B> {
    pub fn new(device: B::Device, adapter: AdapterInfo, tearing_supported: bool) -> Self {
        Self {
            device,
            adapter,
            tearing_supported,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub description: String,
    pub dedicated_video_memory: usize,
    pub software: bool,
}
