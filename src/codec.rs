//! Sample-format conversion, base64 framing and JPEG encoding.
//!
//! Outbound PCM is 16-bit signed little-endian. Floats are mapped
//! asymmetrically (negative side scaled by 32768, positive by 32767) so that
//! both -1.0 and 1.0 are representable and decode(encode(x)) stays within
//! one quantization step.

use base64::engine::general_purpose;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};

use crate::error::{CodecError, DecodeError};

/// Convert float samples in [-1, 1] to i16. Out-of-range input is clamped.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| f32_sample_to_i16(s)).collect()
}

#[inline]
pub fn f32_sample_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Convert i16 samples to floats in [-1, 1].
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| i16_sample_to_f32(s)).collect()
}

#[inline]
pub fn i16_sample_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Serialize samples as little-endian bytes.
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Parse little-endian PCM bytes. An odd trailing byte means the payload
/// was cut mid-sample and is rejected rather than silently truncated.
pub fn le_bytes_to_i16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(general_purpose::STANDARD.decode(data.trim())?)
}

/// Base64 text for a block of i16 samples, as sent in `media_chunks`.
pub fn encode_pcm_base64(samples: &[i16]) -> String {
    encode_base64(&i16_to_le_bytes(samples))
}

/// Decode an inline base64 PCM payload straight to float samples.
pub fn decode_pcm_base64(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = decode_base64(data)?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(i16_to_f32(&le_bytes_to_i16(&bytes)?))
}

/// Extract the `rate=` parameter from a mime type such as
/// `audio/pcm;rate=24000`.
pub fn pcm_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Linear-interpolation resampler. Good enough for speech; used where a
/// source or device does not run at the protocol rate.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        })
        .collect()
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks_exact(n)
        .map(|frame| frame.iter().sum::<f32>() / n as f32)
        .collect()
}

/// Resize a raster to exactly `width`x`height`.
pub fn downscale(raster: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if raster.width() == width && raster.height() == height {
        return raster.clone();
    }
    image::imageops::resize(raster, width, height, FilterType::Triangle)
}

/// Encode an RGBA raster as baseline JPEG. `quality` is 1..=100.
pub fn encode_jpeg(raster: &RgbaImage, quality: u8) -> Result<Vec<u8>, CodecError> {
    if raster.width() == 0 || raster.height() == 0 {
        return Err(CodecError::Raster {
            width: raster.width(),
            height: raster.height(),
        });
    }
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgba8(raster.clone()).to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(&rgb)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn pcm_round_trip_within_one_step() {
        let mut rng = rand::rng();
        let samples: Vec<f32> = (0..4096).map(|_| rng.random_range(-1.0f32..=1.0)).collect();
        let decoded = i16_to_f32(&f32_to_i16(&samples));
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} -> {b}");
        }
    }

    #[test]
    fn pcm_round_trip_is_idempotent_on_i16() {
        let ints: Vec<i16> = vec![i16::MIN, -16384, -1, 0, 1, 12345, i16::MAX];
        let once = f32_to_i16(&i16_to_f32(&ints));
        assert_eq!(once, ints);
        let twice = f32_to_i16(&i16_to_f32(&once));
        assert_eq!(twice, ints);
    }

    #[test]
    fn extremes_are_clamped() {
        assert_eq!(f32_to_i16(&[-2.0, -1.0, 1.0, 3.5, f32::NAN]), vec![-32768, -32768, 32767, 32767, 0]);
    }

    #[test]
    fn le_bytes_reject_odd_length() {
        assert!(matches!(le_bytes_to_i16(&[1, 2, 3]), Err(DecodeError::OddLength(3))));
        assert_eq!(le_bytes_to_i16(&[0x34, 0x12]).unwrap(), vec![0x1234]);
    }

    #[test]
    fn pcm_base64_decodes_to_floats() {
        let b64 = encode_pcm_base64(&[0, 32767, -32768]);
        let floats = decode_pcm_base64(&b64).unwrap();
        assert_eq!(floats, vec![0.0, 1.0, -1.0]);
        assert!(matches!(decode_pcm_base64("not base64!"), Err(DecodeError::Base64(_))));
        assert!(matches!(decode_pcm_base64(""), Err(DecodeError::Empty)));
    }

    #[test]
    fn mime_rate_parsing() {
        assert_eq!(pcm_rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(pcm_rate_from_mime("audio/pcm; Rate = 16000"), Some(16000));
        assert_eq!(pcm_rate_from_mime("audio/pcm"), None);
    }

    #[test]
    fn resample_changes_length_proportionally() {
        let input = vec![0.5f32; 1600];
        let out = resample_linear(&input, 16_000, 24_000);
        assert_eq!(out.len(), 2400);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let raster = RgbaImage::from_pixel(640, 480, image::Rgba([200, 10, 10, 255]));
        let small = downscale(&raster, 320, 240);
        assert_eq!((small.width(), small.height()), (320, 240));
        let jpeg = encode_jpeg(&small, 50).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
