//! Parameter sweeps over the device under test

mod device;
pub mod runner;
pub mod store;

pub use device::{DeviceControl, NullDevice};
pub use runner::{analyze_acquisition, LoopAnalysis, RetryPolicy, SweepPoint, SweepRunner};
pub use store::{load_offsets, load_summary, load_waveform, OffsetStore};
