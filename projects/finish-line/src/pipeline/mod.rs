// Frame-sampling and reconstruction pipeline

pub mod calibration;
pub mod orchestrator;
pub mod placer;
pub mod raster;
pub mod sampler;
pub mod types;
