//! Streaming sample-rate conversion and fixed-size packet framing.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResampleError {
    #[error("invalid sample rate conversion {from} Hz -> {to} Hz")]
    InvalidRate { from: u32, to: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Repeat the nearest preceding input sample. Cheap; used for playback.
    ZeroOrderHold,
    /// Straight line between neighbouring samples; used for capture.
    Linear,
}

/// Converts a mono `f32` stream between two rates, chunk by chunk.
///
/// Chunk boundaries are invisible in the output: the last input sample of a
/// chunk is carried into the next call.
#[derive(Debug, Clone)]
pub struct Resampler {
    step: f64,
    mode: Interpolation,
    passthrough: bool,
    // Position of the next output sample, in input samples, where index 0 is
    // the carried-over sample from the previous chunk.
    position: f64,
    carried: f32,
}

impl Resampler {
    pub fn new(from: u32, to: u32, mode: Interpolation) -> Result<Self, ResampleError> {
        if from == 0 || to == 0 {
            return Err(ResampleError::InvalidRate { from, to });
        }
        Ok(Self {
            step: f64::from(from) / f64::from(to),
            mode,
            passthrough: from == to,
            position: 1.0,
            carried: 0.0,
        })
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough || input.is_empty() {
            return input.to_vec();
        }

        let len = input.len() as f64;
        let sample = |index: usize| -> f32 {
            if index == 0 {
                self.carried
            } else {
                input[index - 1]
            }
        };

        let mut output = Vec::with_capacity((len / self.step).ceil() as usize + 1);
        let mut position = self.position;
        while position < len {
            let index = position.floor() as usize;
            let value = match self.mode {
                Interpolation::ZeroOrderHold => sample(index),
                Interpolation::Linear => {
                    let frac = (position - index as f64) as f32;
                    let a = sample(index);
                    let b = sample(index + 1);
                    a + (b - a) * frac
                }
            };
            output.push(value);
            position += self.step;
        }

        self.position = position - len;
        self.carried = input[input.len() - 1];
        output
    }
}

/// Regroups a sample stream into packets of exactly `packet_len` samples.
#[derive(Debug, Clone)]
pub struct PacketFramer {
    packet_len: usize,
    buffered: Vec<f32>,
}

impl PacketFramer {
    pub fn new(packet_len: usize) -> Self {
        let packet_len = packet_len.max(1);
        Self {
            packet_len,
            buffered: Vec::with_capacity(packet_len),
        }
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.buffered.extend_from_slice(samples);
        let whole = self.buffered.len() / self.packet_len * self.packet_len;
        let packets = self
            .buffered
            .drain(..whole)
            .collect::<Vec<_>>()
            .chunks(self.packet_len)
            .map(<[f32]>::to_vec)
            .collect();
        packets
    }

    /// Remaining samples zero-padded to one packet, if any are buffered.
    pub fn finish(&mut self) -> Option<Vec<f32>> {
        if self.buffered.is_empty() {
            return None;
        }
        let mut packet = std::mem::take(&mut self.buffered);
        packet.resize(self.packet_len, 0.0);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_rates() {
        assert_eq!(
            Resampler::new(0, 48_000, Interpolation::Linear).unwrap_err(),
            ResampleError::InvalidRate {
                from: 0,
                to: 48_000
            }
        );
    }

    #[test]
    fn equal_rates_pass_samples_through() {
        let mut resampler = Resampler::new(48_000, 48_000, Interpolation::Linear).expect("rate");
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn downsampling_by_two_keeps_every_other_sample() {
        let mut resampler =
            Resampler::new(48_000, 24_000, Interpolation::ZeroOrderHold).expect("rate");
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(resampler.process(&input), vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn output_length_tracks_ratio_across_chunks() {
        let mut resampler = Resampler::new(44_100, 48_000, Interpolation::Linear).expect("rate");
        let chunk = vec![0.0f32; 441];
        let produced: usize = (0..100).map(|_| resampler.process(&chunk).len()).sum();
        // 44_100 input samples at 44.1 kHz make one second of 48 kHz audio.
        assert!((47_998..=48_001).contains(&produced), "produced {produced}");
    }

    #[test]
    fn linear_interpolates_between_chunk_boundaries() {
        let mut resampler = Resampler::new(24_000, 48_000, Interpolation::Linear).expect("rate");
        let first = resampler.process(&[0.0, 1.0]);
        let second = resampler.process(&[2.0]);
        assert_eq!(first, vec![0.0, 0.5]);
        assert_eq!(second, vec![1.0, 1.5]);
    }

    #[test]
    fn framer_emits_whole_packets_and_pads_the_tail() {
        let mut framer = PacketFramer::new(4);
        assert!(framer.push(&[1.0, 2.0, 3.0]).is_empty());
        let packets = framer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(
            packets,
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]
        );
        assert_eq!(framer.finish(), Some(vec![9.0, 0.0, 0.0, 0.0]));
        assert_eq!(framer.finish(), None);
    }
}
