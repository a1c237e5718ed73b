//! Gain stage
//!
//! Multiplies every sample by a volume factor and saturates to the i16
//! range. Used on the client at capture time and on the server before the
//! virtual device, with identical rules on both sides.

use crate::audio::frame::AudioFrame;
use crate::constants::{MAX_VOLUME, MIN_VOLUME};

/// Scale one sample, saturating instead of wrapping
#[inline]
pub fn scale_sample(sample: i16, volume: f32) -> i16 {
    let scaled = sample as f32 * volume;
    // `as` from float saturates at the integer bounds and truncates toward zero
    scaled as i16
}

/// Scale a PCM16LE byte buffer in place
pub fn apply_gain_in_place(pcm: &mut [u8], volume: f32) {
    let volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
    if volume == 1.0 {
        return;
    }
    for bytes in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        bytes.copy_from_slice(&scale_sample(sample, volume).to_le_bytes());
    }
}

/// Apply `volume` to a frame.
///
/// `volume` is clamped to `[0.0, 2.0]`; `1.0` returns the frame untouched.
pub fn apply_gain(mut frame: AudioFrame, volume: f32) -> AudioFrame {
    apply_gain_in_place(frame.as_bytes_mut(), volume);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_half_scale_doubles_to_full_scale() {
        let frame = AudioFrame::from_samples(&[16000; 64], 1);
        let out = apply_gain(frame, 2.0);
        assert!(out.samples().all(|s| s == 32000));

        let frame = AudioFrame::from_samples(&[16384; 64], 1);
        let out = apply_gain(frame, 2.0);
        assert!(out.samples().all(|s| s == 32767));

        let frame = AudioFrame::from_samples(&[17000; 64], 1);
        let out = apply_gain(frame, 2.0);
        assert!(out.samples().all(|s| s == 32767));

        let frame = AudioFrame::from_samples(&[-17000; 64], 1);
        let out = apply_gain(frame, 2.0);
        assert!(out.samples().all(|s| s == -32768));
    }

    #[test]
    fn test_zero_volume_silences() {
        let frame = AudioFrame::from_samples(&[i16::MIN, -1, 1, i16::MAX], 1);
        let out = apply_gain(frame, 0.0);
        assert!(out.samples().all(|s| s == 0));
    }

    #[test]
    fn test_out_of_range_volume_is_clamped() {
        let frame = AudioFrame::from_samples(&[10000, -10000], 1);
        let out = apply_gain(frame, 5.0);
        assert_eq!(out.samples().collect::<Vec<_>>(), vec![20000, -20000]);
    }

    proptest! {
        #[test]
        fn prop_unity_gain_is_identity(samples in proptest::collection::vec(any::<i16>(), 0..512)) {
            let frame = AudioFrame::from_samples(&samples, 1);
            let once = apply_gain(frame.clone(), 1.0);
            prop_assert_eq!(&once, &frame);
            let twice = apply_gain(once, 1.0);
            prop_assert_eq!(twice, frame);
        }

        #[test]
        fn prop_gain_saturates(
            samples in proptest::collection::vec(any::<i16>(), 1..512),
            volume in 0.0f32..=2.0,
        ) {
            let frame = AudioFrame::from_samples(&samples, 1);
            let out = apply_gain(frame, volume);
            for (input, output) in samples.iter().zip(out.samples()) {
                let exact = *input as f64 * volume as f64;
                let clamped = exact.clamp(i16::MIN as f64, i16::MAX as f64);
                // Never wraps: sign is preserved and the error stays below one step
                prop_assert!((output as f64 - clamped).abs() < 1.0 + 1e-3 * clamped.abs());
                if *input != 0 && output != 0 {
                    prop_assert_eq!(input.signum(), output.signum());
                }
            }
        }
    }
}
