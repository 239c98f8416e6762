//! Audio codec helpers
//!
//! Opus decode for the VAD path, Opus encode for pre-recorded clips, and
//! the in-memory WAV rendering handed to speaker identification. Everything
//! here is 16 kHz mono 16-bit.

use std::io::Cursor;
use std::path::Path;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};

use crate::PipelineError;

pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per 60 ms wire frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 960;

pub struct OpusStreamDecoder {
    decoder: Decoder,
}

impl OpusStreamDecoder {
    pub fn new() -> Result<Self, PipelineError> {
        let decoder = Decoder::new(SampleRate::Hz16000, Channels::Mono)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        Ok(Self { decoder })
    }

    /// Decode one packet into PCM samples.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, PipelineError> {
        let packet = audiopus::packet::Packet::try_from(packet)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let signals = MutSignals::try_from(&mut pcm)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        let written = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        pcm.truncate(written);
        Ok(pcm)
    }
}

/// Reinterpret raw little-endian PCM bytes as samples.
pub fn pcm_bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Render samples as an in-memory WAV file.
pub fn samples_to_wav(samples: &[i16]) -> Result<Vec<u8>, PipelineError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| PipelineError::Decode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Load a WAV clip and encode it into 60 ms Opus frames for the wire.
pub fn load_wav_as_opus_frames(path: &Path) -> Result<Vec<Vec<u8>>, PipelineError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| PipelineError::AudioFile(format!("{}: {e}", path.display())))?;
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(|e| PipelineError::AudioFile(e.to_string()))?;

    let encoder = Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Voip)
        .map_err(|e| PipelineError::AudioFile(e.to_string()))?;

    let mut frames = Vec::with_capacity(samples.len() / FRAME_SAMPLES + 1);
    let mut buffer = vec![0u8; 1500];
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let mut frame = chunk.to_vec();
        frame.resize(FRAME_SAMPLES, 0); // zero-pad the trailing partial frame
        let written = encoder
            .encode(&frame, &mut buffer)
            .map_err(|e| PipelineError::AudioFile(e.to_string()))?;
        frames.push(buffer[..written].to_vec());
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_byte_conversion() {
        let bytes = [0x00, 0x01, 0xFF, 0x7F];
        assert_eq!(pcm_bytes_to_samples(&bytes), vec![256, i16::MAX]);
    }

    #[test]
    fn wav_render_has_riff_header() {
        let wav = samples_to_wav(&[0i16; 320]).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn wav_clip_round_trips_to_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        // 150 ms of a quiet ramp: two full frames plus a partial one.
        for i in 0..2400i32 {
            writer.write_sample((i % 256) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let frames = load_wav_as_opus_frames(&path).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| !f.is_empty()));
    }

    #[test]
    fn missing_clip_is_an_audio_file_error() {
        let err = load_wav_as_opus_frames(Path::new("/nonexistent.wav")).unwrap_err();
        assert!(matches!(err, PipelineError::AudioFile(_)));
    }
}
