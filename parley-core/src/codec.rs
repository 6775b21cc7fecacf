//! Audio payload encoding.
//!
//! Synthesized audio travels inside events as `EncodedAudio`: 16-bit PCM,
//! either wrapped in a WAV container (`hound`) or raw little-endian. The JSON
//! form carries the bytes base64-encoded.

use std::io::Cursor;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffering::AudioChunk;
use crate::config::AudioFormat;
use crate::error::{ParleyError, Result};

/// Encoded audio plus the facts a player needs to schedule it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudio {
    pub format: AudioFormat,
    pub sample_rate: u32,
    /// Seconds of audio represented by `data`.
    pub duration: f64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Encode a chunk as mono 16-bit PCM in the requested container.
///
/// # Errors
/// `ParleyError::Encoding` if the WAV writer fails.
pub fn encode(chunk: &AudioChunk, format: AudioFormat) -> Result<EncodedAudio> {
    let data = match format {
        AudioFormat::Wav => encode_wav(chunk)?,
        AudioFormat::Pcm16 => chunk
            .samples
            .iter()
            .flat_map(|s| to_i16(*s).to_le_bytes())
            .collect(),
    };
    Ok(EncodedAudio {
        format,
        sample_rate: chunk.sample_rate,
        duration: chunk.duration_secs(),
        data,
    })
}

fn encode_wav(chunk: &AudioChunk) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: chunk.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ParleyError::Encoding(format!("wav header: {e}")))?;
        for sample in &chunk.samples {
            writer
                .write_sample(to_i16(*sample))
                .map_err(|e| ParleyError::Encoding(format!("wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ParleyError::Encoding(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Decode a WAV byte buffer into mono f32, averaging channels.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioChunk> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ParleyError::Encoding(format!("wav read: {e}")))?;
    read_wav(reader)
}

/// Read a WAV file from disk into mono f32.
pub fn read_wav_file(path: &Path) -> Result<AudioChunk> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| ParleyError::Encoding(format!("{}: {e}", path.display())))?;
    read_wav(reader)
}

fn read_wav<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<AudioChunk> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ParleyError::Encoding(format!("wav samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ParleyError::Encoding(format!("wav samples: {e}")))?
        }
    };
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok(AudioChunk::new(samples, spec.sample_rate))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
