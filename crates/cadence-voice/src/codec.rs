//! Conversion between inbound audio payloads and [`AudioFrame`].
//!
//! Everything here is a pure function. Frames are always stored as signed
//! 16-bit PCM, so `decode(encode(frame))` is lossless.

use crate::error::DecodeError;
use cadence_types::{AudioFormat, AudioFrame};
use std::io::Cursor;
use std::ops::RangeInclusive;

/// Channel counts the pipeline accepts.
pub const SUPPORTED_CHANNELS: RangeInclusive<u16> = 1..=2;

/// Sample rates the pipeline accepts, in Hz.
pub const SUPPORTED_SAMPLE_RATES: RangeInclusive<u32> = 8_000..=48_000;

/// The body of an inbound audio message.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Little-endian PCM. Width 1 is unsigned 8-bit, widths 2 and 4 are signed.
    Pcm { bytes: Vec<u8>, sample_width: u16 },
    /// Normalized float samples, as produced by the Web Audio API.
    Samples(Vec<f32>),
    /// A complete WAV container; its header overrides the declared format.
    Wav(Vec<u8>),
}

/// An undecoded payload together with the format the sender declared for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub payload: RawPayload,
    pub format: AudioFormat,
    pub timestamp_ms: u64,
}

impl RawAudio {
    pub fn pcm16(bytes: Vec<u8>, format: AudioFormat, timestamp_ms: u64) -> Self {
        Self {
            payload: RawPayload::Pcm {
                bytes,
                sample_width: 2,
            },
            format,
            timestamp_ms,
        }
    }

    pub fn samples(samples: Vec<f32>, format: AudioFormat, timestamp_ms: u64) -> Self {
        Self {
            payload: RawPayload::Samples(samples),
            format,
            timestamp_ms,
        }
    }
}

/// Decodes a raw payload into a canonical frame.
///
/// # Errors
///
/// Returns [`DecodeError`] for unsupported widths, channel counts or rates,
/// for payloads that do not hold a whole number of sample frames, and for
/// non-finite float samples.
pub fn decode(raw: RawAudio) -> Result<AudioFrame, DecodeError> {
    let RawAudio {
        payload,
        format,
        timestamp_ms,
    } = raw;

    let (samples, format) = match payload {
        RawPayload::Pcm {
            bytes,
            sample_width,
        } => {
            validate_format(format)?;
            (decode_pcm(&bytes, sample_width, format.channels)?, format)
        }
        RawPayload::Samples(values) => {
            validate_format(format)?;
            (decode_floats(&values, format.channels)?, format)
        }
        RawPayload::Wav(bytes) => decode_wav(&bytes)?,
    };

    Ok(AudioFrame::new(samples, format, timestamp_ms))
}

/// Encodes a frame as 16-bit little-endian PCM.
pub fn encode(frame: &AudioFrame) -> RawAudio {
    RawAudio::pcm16(
        pcm16_bytes(frame.samples()),
        frame.format(),
        frame.timestamp_ms(),
    )
}

/// Serializes samples as 16-bit little-endian PCM.
pub fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Wraps samples in a WAV container, for providers that want a file upload.
pub fn to_wav(samples: &[i16], format: AudioFormat) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        let mut pcm = writer.get_i16_writer(samples.len() as u32);
        for &sample in samples {
            pcm.write_sample(sample);
        }
        pcm.flush()?;
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn validate_format(format: AudioFormat) -> Result<(), DecodeError> {
    if !SUPPORTED_CHANNELS.contains(&format.channels) {
        return Err(DecodeError::UnsupportedChannelCount(format.channels));
    }
    if !SUPPORTED_SAMPLE_RATES.contains(&format.sample_rate) {
        return Err(DecodeError::UnsupportedSampleRate(format.sample_rate));
    }
    Ok(())
}

fn decode_pcm(bytes: &[u8], sample_width: u16, channels: u16) -> Result<Vec<i16>, DecodeError> {
    if !matches!(sample_width, 1 | 2 | 4) {
        return Err(DecodeError::UnsupportedSampleWidth(sample_width));
    }
    let width = usize::from(sample_width);
    let frame_bytes = width * usize::from(channels);
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::MisalignedPayload {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let samples = match sample_width {
        1 => bytes.iter().map(|&b| (i16::from(b) - 128) << 8).collect(),
        2 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 16) as i16)
            .collect(),
    };
    Ok(samples)
}

fn decode_floats(values: &[f32], channels: u16) -> Result<Vec<i16>, DecodeError> {
    let channels = usize::from(channels);
    if values.len() % channels != 0 {
        return Err(DecodeError::MisalignedPayload {
            len: values.len() * 4,
            frame_bytes: channels * 4,
        });
    }
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if v.is_finite() {
                Ok(float_to_i16(v))
            } else {
                Err(DecodeError::NonFiniteSample(i))
            }
        })
        .collect()
}

fn float_to_i16(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<i16>, AudioFormat), DecodeError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| DecodeError::Wav(e.to_string()))?;
    let spec = reader.spec();
    let format = AudioFormat::new(spec.sample_rate, spec.channels);
    validate_format(format)?;

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => {
            let values = reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DecodeError::Wav(e.to_string()))?;
            decode_floats(&values, spec.channels)?
        }
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if !(8..=32).contains(&bits) {
                return Err(DecodeError::UnsupportedSampleWidth(bits.div_ceil(8)));
            }
            reader
                .into_samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if bits > 16 {
                            (v >> (bits - 16)) as i16
                        } else {
                            (v << (16 - bits)) as i16
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DecodeError::Wav(e.to_string()))?
        }
    };
    Ok((samples, format))
}
