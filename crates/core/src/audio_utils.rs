use bytes::Bytes;

// Fixed wire rates of the voice stream, both directions PCM16 mono.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Interprets raw little-endian PCM16 bytes as normalized f32 samples.
/// A trailing odd byte is ignored.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Encodes f32 samples as little-endian PCM16 bytes.
pub fn f32_to_pcm16_le(pcm32: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(pcm32.len() * 2);
    for sample in convert_f32_to_i16(pcm32) {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

/// A frame of PCM16 silence.
pub fn silence_pcm16(samples: usize) -> Bytes {
    Bytes::from(vec![0u8; samples * 2])
}

/// Root-mean-square level of a frame, 0.0 for an empty one.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_f32_to_i16_scaling() {
        let i16_samples = convert_f32_to_i16(&[0.0, 0.5, -0.5, 1.0, -1.0]);
        assert_eq!(i16_samples, vec![0, 16383, -16383, 32767, -32767]);
    }

    #[test]
    fn test_f32_clamping() {
        let i16_samples = convert_f32_to_i16(&[1.5, -1.5]);
        assert_eq!(i16_samples, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_pcm16_bytes() {
        let bytes = f32_to_pcm16_le(&[0.5, -0.25]);
        assert_eq!(bytes.len(), 4);

        let decoded = pcm16_le_to_f32(&bytes);
        assert_eq!(decoded.len(), 2);
        assert_abs_diff_eq!(decoded[0], 0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(decoded[1], -0.25, epsilon = 1e-4);

        // odd trailing byte is dropped
        assert_eq!(pcm16_le_to_f32(&[0, 0, 7]).len(), 1);
    }

    #[test]
    fn test_silence_and_rms() {
        let silence = silence_pcm16(1600);
        assert_eq!(silence.len(), 3200);
        assert!(silence.iter().all(|b| *b == 0));

        assert_eq!(rms(&[]), 0.0);
        assert_abs_diff_eq!(rms(&[0.5, -0.5, 0.5, -0.5]), 0.5, epsilon = 1e-6);
    }
}
