//! Compressed segment bytes to interleaved f32 PCM.
//!
//! Decoding is CPU-bound and runs on blocking threads; nothing here
//! touches the real-time audio callback.

use std::io::Cursor;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::error::{DvrError, DvrResult};

/// A fully decoded stretch of audio: interleaved f32 samples plus the
/// stream parameters the output device must be opened with.
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Drop the first `skip` frames, keeping the tail.
    ///
    /// Used after decoding two segments as one continuous stream: the tail
    /// beyond the first segment's frame count is exactly the second
    /// segment, with the decoder already warmed up across the boundary.
    pub fn split_tail(mut self, skip: usize) -> DecodedAudio {
        let at = (skip * self.channels as usize).min(self.samples.len());
        self.samples.drain(..at);
        self
    }
}

/// Decode a complete in-memory segment (or a concatenation of segments)
/// into PCM.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> DvrResult<DecodedAudio> {
    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DvrError::DecodeError("no decodable track".to_string()))?;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut output = DecodedAudio::default();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if output.samples.is_empty() {
                    output.channels = spec.channels.count() as u16;
                    output.sample_rate = spec.rate;
                }
                let buf = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
                });
                buf.copy_interleaved_ref(decoded);
                output.samples.extend_from_slice(buf.samples());
            }
            // Corrupt packets happen at segment boundaries of a live
            // stream; skip them and keep decoding.
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("Skipping undecodable packet: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if output.samples.is_empty() {
        return Err(DvrError::DecodeError(
            "stream produced no audio".to_string(),
        ));
    }
    Ok(output)
}
