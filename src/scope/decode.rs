//! Raw capture decoding
//!
//! The digitizer returns one binary block per channel: a header followed by
//! one signed 8-bit code per sample, all sequence-mode segments concatenated.
//! Codes are converted to volts with the channel's vertical calibration:
//! 25 codes span one vertical division.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::DecodeError;

/// ADC codes per vertical division in the BYTE waveform format
pub const CODES_PER_DIVISION: f64 = 25.0;

/// Header bytes per segment in sequence-mode framing
const SEQUENCE_HEADER_PER_SEGMENT: usize = 16;

/// Fixed header bytes in sequence-mode framing
const SEQUENCE_HEADER_BASE: usize = 32;

/// How many header bytes precede the sample payload of a capture
pub trait HeaderLayout {
    fn header_length(&self, segment_count: usize, samples_per_segment: usize) -> usize;
}

/// Sequence-mode framing: `segments * 16 + 32` header bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceHeader;

impl HeaderLayout for SequenceHeader {
    fn header_length(&self, segment_count: usize, _samples_per_segment: usize) -> usize {
        segment_count * SEQUENCE_HEADER_PER_SEGMENT + SEQUENCE_HEADER_BASE
    }
}

/// Header of a fixed size regardless of the acquisition shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader(pub usize);

impl HeaderLayout for FixedHeader {
    fn header_length(&self, _segment_count: usize, _samples_per_segment: usize) -> usize {
        self.0
    }
}

/// Scalar calibration for one channel of one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Vertical scale (V/div)
    pub volts_per_div: f64,
    /// Vertical offset (V)
    pub offset_volts: f64,
    /// Sample interval (s)
    pub dt: f64,
    /// Bytes to skip before the sample payload
    pub clip: usize,
}

impl CaptureMetadata {
    /// Build metadata with the header length taken from a layout
    pub fn with_layout(
        volts_per_div: f64,
        offset_volts: f64,
        dt: f64,
        layout: &dyn HeaderLayout,
        segment_count: usize,
        samples_per_segment: usize,
    ) -> Self {
        Self {
            volts_per_div,
            offset_volts,
            dt,
            clip: layout.header_length(segment_count, samples_per_segment),
        }
    }

    /// Volts represented by one ADC code
    pub fn volts_per_code(&self) -> f64 {
        self.volts_per_div / CODES_PER_DIVISION
    }
}

/// Calibrated (time, amplitude) samples of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedChannel {
    pub time: Vec<f64>,
    pub amplitude: Vec<f64>,
    pub dt: f64,
}

impl CalibratedChannel {
    /// Build a channel on a uniform time axis starting at zero
    pub fn from_amplitudes(amplitude: Vec<f64>, dt: f64) -> Self {
        let time = (0..amplitude.len()).map(|i| i as f64 * dt).collect();
        Self { time, amplitude, dt }
    }

    pub fn len(&self) -> usize {
        self.amplitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amplitude.is_empty()
    }

    /// Move the whole time axis by `origin` seconds
    ///
    /// Used to keep time values of successive loops distinct.
    pub fn shifted(mut self, origin: f64) -> Self {
        for t in &mut self.time {
            *t += origin;
        }
        self
    }

    /// Whether both channels carry bit-identical time axes
    pub fn same_time_axis(&self, other: &CalibratedChannel) -> bool {
        self.time == other.time
    }
}

/// Decode one raw capture into a calibrated channel
///
/// A header longer than the buffer yields an empty channel.
pub fn decode_capture(raw: &[u8], metadata: &CaptureMetadata) -> CalibratedChannel {
    let header_end = metadata.clip.min(raw.len());
    let (header, payload) = raw.split_at(header_end);

    if !header.is_empty() {
        let preview = &header[..header.len().min(32)];
        trace!("Capture header ({} bytes): {}", header.len(), hex::encode(preview));
    }

    let scale = metadata.volts_per_code();
    let amplitude: Vec<f64> = payload
        .iter()
        .map(|&b| (b as i8) as f64 * scale + metadata.offset_volts)
        .collect();

    debug!(
        "Decoded {} samples (clip={}, {:.4} V/div, offset {:.4} V, dt={:e})",
        amplitude.len(),
        metadata.clip,
        metadata.volts_per_div,
        metadata.offset_volts,
        metadata.dt
    );

    CalibratedChannel::from_amplitudes(amplitude, metadata.dt)
}

/// Decode the reference and chip captures of one acquisition
///
/// Both channels must end up on an identical time axis.
pub fn decode_pair(
    reference_raw: &[u8],
    reference_meta: &CaptureMetadata,
    chip_raw: &[u8],
    chip_meta: &CaptureMetadata,
) -> Result<(CalibratedChannel, CalibratedChannel), DecodeError> {
    let reference = decode_capture(reference_raw, reference_meta);
    let chip = decode_capture(chip_raw, chip_meta);

    if !reference.same_time_axis(&chip) {
        return Err(DecodeError::TimeAxisMismatch {
            reference: reference.len(),
            chip: chip.len(),
            reference_dt: reference.dt,
            chip_dt: chip.dt,
        });
    }

    Ok((reference, chip))
}

/// Encode volts back into raw codes behind a header of `clip` zero bytes
///
/// Inverse of [`decode_capture`] up to quantisation; codes saturate at the i8 range.
pub fn encode_capture(amplitude: &[f64], metadata: &CaptureMetadata) -> Vec<u8> {
    let scale = metadata.volts_per_code();
    let mut raw = vec![0u8; metadata.clip];
    raw.extend(amplitude.iter().map(|&v| {
        let code = ((v - metadata.offset_volts) / scale).round();
        code.clamp(i8::MIN as f64, i8::MAX as f64) as i8 as u8
    }));
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(clip: usize) -> CaptureMetadata {
        CaptureMetadata {
            volts_per_div: 0.05,
            offset_volts: -0.01,
            dt: 1e-10,
            clip,
        }
    }

    #[test]
    fn test_sequence_header_length() {
        assert_eq!(SequenceHeader.header_length(5000, 500), 80_032);
        assert_eq!(SequenceHeader.header_length(0, 500), 32);
        assert_eq!(FixedHeader(364).header_length(5000, 500), 364);
    }

    #[test]
    fn test_metadata_from_layout() {
        let m = CaptureMetadata::with_layout(0.35, 0.0, 1e-10, &SequenceHeader, 10, 100);
        assert_eq!(m.clip, 192);
        assert!((m.volts_per_code() - 0.014).abs() < 1e-12);
    }

    #[test]
    fn test_decode_round_trip() {
        let m = meta(48);
        let codes: Vec<i8> = vec![-128, -25, -1, 0, 1, 25, 100, 127];
        let expected: Vec<f64> = codes
            .iter()
            .map(|&c| c as f64 * (0.05 / 25.0) - 0.01)
            .collect();

        let raw = encode_capture(&expected, &m);
        assert_eq!(raw.len(), 48 + codes.len());

        let channel = decode_capture(&raw, &m);
        assert_eq!(channel.len(), codes.len());
        for (got, want) in channel.amplitude.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }
        for (i, t) in channel.time.iter().enumerate() {
            assert_eq!(*t, i as f64 * 1e-10);
        }
    }

    #[test]
    fn test_decode_skips_header_bytes() {
        let mut raw = vec![0xAAu8; 4];
        raw.extend([25u8, 0xE7]); // +25, -25
        let channel = decode_capture(&raw, &meta(4));
        assert_eq!(channel.len(), 2);
        assert!((channel.amplitude[0] - 0.04).abs() < 1e-12);
        assert!((channel.amplitude[1] + 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_decode_header_longer_than_buffer() {
        let channel = decode_capture(&[1, 2, 3], &meta(10));
        assert!(channel.is_empty());
        assert!(channel.time.is_empty());
    }

    #[test]
    fn test_decode_pair_rejects_different_time_axes() {
        let m = meta(0);
        let result = decode_pair(&[0, 1, 2], &m, &[0, 1], &m);
        assert!(matches!(
            result,
            Err(DecodeError::TimeAxisMismatch { reference: 3, chip: 2, .. })
        ));

        let mut other = m;
        other.dt = 2e-10;
        assert!(decode_pair(&[0, 1], &m, &[0, 1], &other).is_err());
    }

    #[test]
    fn test_decode_pair_ok() {
        let m = meta(2);
        let (r, c) = decode_pair(&[9, 9, 1, 2, 3], &m, &[9, 9, 3, 2, 1], &m).unwrap();
        assert_eq!(r.time, c.time);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_shifted_time_axis() {
        let channel = CalibratedChannel::from_amplitudes(vec![0.0; 3], 1.0).shifted(10.0);
        assert_eq!(channel.time, vec![10.0, 11.0, 12.0]);
        assert_eq!(channel.shifted(-0.5).time, vec![9.5, 10.5, 11.5]);
    }
}
