//! Resampler stage: retimes capture streams to the codec rate.

use crate::error::AudioInputError;
use speex_rust_aec::Resampler;

pub(crate) const RESAMPLE_QUALITY: i32 = 3;

/// Retimes one stream to [`SAMPLE_RATE`](crate::SAMPLE_RATE). A no-op
/// pass-through when the device already runs at the codec rate.
///
/// Interleaved multi-channel operation keeps the per-channel streams intact
/// for the multi-channel echo canceller tail.
pub(crate) struct ResamplerStage {
    inner: Option<Resampler>,
}

// The resampler state is owned exclusively and only driven behind the front
// end mutex of its capture stream.
unsafe impl Send for ResamplerStage {}

impl ResamplerStage {
    pub(crate) fn new(
        channels: u32,
        in_rate: u32,
        out_rate: u32,
    ) -> Result<Self, AudioInputError> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(
                Resampler::new(channels, in_rate, out_rate, RESAMPLE_QUALITY)
                    .map_err(|err| AudioInputError::Resampler(err.to_string()))?,
            )
        };

        Ok(Self { inner })
    }

    /// Processes one frame. `output` must be zeroed and sized to the codec
    /// rate; the resampler's startup latency may leave a short zero tail on
    /// the first frames. Returns the interleaved samples produced.
    pub(crate) fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<usize, AudioInputError> {
        match &mut self.inner {
            None => {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                Ok(n)
            }
            Some(resampler) => {
                let (consumed, produced) = resampler
                    .process_interleaved_f32(input, output)
                    .map_err(|err| AudioInputError::Resampler(err.to_string()))?;
                if consumed < input.len() {
                    tracing::trace!(
                        consumed,
                        input = input.len(),
                        "resampler left input samples unconsumed"
                    );
                }
                Ok(produced)
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_copies_when_rates_match() {
        let mut stage = ResamplerStage::new(1, 48_000, 48_000).unwrap();
        let input = [0.5f32; 480];
        let mut output = [0.0f32; 480];

        let produced = stage.process(&input, &mut output).unwrap();

        assert_eq!(produced, 480);
        assert_eq!(output, input);
    }

    #[test]
    fn resamples_to_codec_rate() {
        // 44.1 kHz device frame for a 480 sample codec frame.
        let mut stage = ResamplerStage::new(1, 44_100, 48_000).unwrap();
        let input = vec![0.25f32; 441];
        let mut output = vec![0.0f32; 480];

        let produced = stage.process(&input, &mut output).unwrap();

        // Startup latency may shorten the first frame, but never beyond the
        // filter delay.
        assert!(produced <= 480);
        assert!(produced > 400);
    }
}
