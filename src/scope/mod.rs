//! Digitizer side of the pipeline
//!
//! 1. Acquire sequence-mode captures of the reference and chip channels
//! 2. Strip the header and calibrate the signed 8-bit codes to volts
//! 3. Detect threshold crossings on each channel

pub mod capture;
mod crossing;
mod decode;
pub mod synthetic;

pub use capture::{
    AcquisitionRequest, AcquisitionWorker, CaptureStats, ChannelCapture, Instrument,
    RawAcquisition,
};
pub use crossing::{
    detect_crossings, detect_crossings_hysteresis, detect_with_policy, CrossingPolicy,
    CrossingSet, EdgeDirection,
};
pub use decode::{
    decode_capture, decode_pair, encode_capture, CalibratedChannel, CaptureMetadata,
    FixedHeader, HeaderLayout, SequenceHeader, CODES_PER_DIVISION,
};
pub use synthetic::{synthetic_bench, SyntheticConfig, SyntheticDevice, SyntheticInstrument};
