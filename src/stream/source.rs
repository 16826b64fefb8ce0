//! Audio sources: probing a song file and cutting its PCM data into chunks.
//!
//! Sources are read with symphonia's format readers only; no decoding is
//! done. The raw sample bytes are forwarded as-is, and the header line tells
//! the receiver how to interpret them.

use std::fmt;
use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::{
    CODEC_TYPE_NULL, CODEC_TYPE_PCM_ALAW, CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F64BE, CODEC_TYPE_PCM_F64LE, CODEC_TYPE_PCM_MULAW, CODEC_TYPE_PCM_S8,
    CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE, CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_U8, CODEC_TYPE_PCM_U16BE,
    CODEC_TYPE_PCM_U16LE, CODEC_TYPE_PCM_U24BE, CODEC_TYPE_PCM_U24LE, CODEC_TYPE_PCM_U32BE,
    CODEC_TYPE_PCM_U32LE, CodecType,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Sample encoding, named the way receivers expect it in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    PcmSigned,
    PcmUnsigned,
    PcmFloat,
    Alaw,
    Ulaw,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::PcmSigned => "PCM_SIGNED",
            Encoding::PcmUnsigned => "PCM_UNSIGNED",
            Encoding::PcmFloat => "PCM_FLOAT",
            Encoding::Alaw => "ALAW",
            Encoding::Ulaw => "ULAW",
        })
    }
}

/// Parameters a receiver needs to decode the raw stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: f32,
    pub bits_per_sample: u32,
    pub channels: u32,
    /// Bytes per frame (one sample for every channel)
    pub frame_size: u32,
    pub frame_rate: f32,
    pub big_endian: bool,
}

impl AudioFormat {
    /// The header line block sent before the first chunk, seven
    /// newline-terminated fields.
    pub fn header(&self) -> String {
        format!(
            "{}\n{:.1}\n{}\n{}\n{}\n{:.1}\n{}\n",
            self.encoding,
            self.sample_rate,
            self.bits_per_sample,
            self.channels,
            self.frame_size,
            self.frame_rate,
            self.big_endian
        )
    }
}

/// Encoding, byte order and sample width implied by a PCM codec.
fn describe_codec(codec: CodecType) -> Option<(Encoding, bool, u32)> {
    let described = match codec {
        CODEC_TYPE_PCM_S8 => (Encoding::PcmSigned, false, 8),
        CODEC_TYPE_PCM_S16LE => (Encoding::PcmSigned, false, 16),
        CODEC_TYPE_PCM_S16BE => (Encoding::PcmSigned, true, 16),
        CODEC_TYPE_PCM_S24LE => (Encoding::PcmSigned, false, 24),
        CODEC_TYPE_PCM_S24BE => (Encoding::PcmSigned, true, 24),
        CODEC_TYPE_PCM_S32LE => (Encoding::PcmSigned, false, 32),
        CODEC_TYPE_PCM_S32BE => (Encoding::PcmSigned, true, 32),
        CODEC_TYPE_PCM_U8 => (Encoding::PcmUnsigned, false, 8),
        CODEC_TYPE_PCM_U16LE => (Encoding::PcmUnsigned, false, 16),
        CODEC_TYPE_PCM_U16BE => (Encoding::PcmUnsigned, true, 16),
        CODEC_TYPE_PCM_U24LE => (Encoding::PcmUnsigned, false, 24),
        CODEC_TYPE_PCM_U24BE => (Encoding::PcmUnsigned, true, 24),
        CODEC_TYPE_PCM_U32LE => (Encoding::PcmUnsigned, false, 32),
        CODEC_TYPE_PCM_U32BE => (Encoding::PcmUnsigned, true, 32),
        CODEC_TYPE_PCM_F32LE => (Encoding::PcmFloat, false, 32),
        CODEC_TYPE_PCM_F32BE => (Encoding::PcmFloat, true, 32),
        CODEC_TYPE_PCM_F64LE => (Encoding::PcmFloat, false, 64),
        CODEC_TYPE_PCM_F64BE => (Encoding::PcmFloat, true, 64),
        CODEC_TYPE_PCM_ALAW => (Encoding::Alaw, false, 8),
        CODEC_TYPE_PCM_MULAW => (Encoding::Ulaw, false, 8),
        _ => return None,
    };
    Some(described)
}

/// An opened song file positioned at its first packet.
pub struct AudioSource {
    reader: Box<dyn FormatReader>,
    track_id: u32,
    format: AudioFormat,
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("track_id", &self.track_id)
            .field("format", &self.format)
            .finish()
    }
}

impl AudioSource {
    /// Probe `path` and read the stream parameters of its first audio track.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension() {
            hint.with_extension(&ext.to_string_lossy());
        }

        let opened = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::audio(format!("{}: {}", path.display(), e)))?;
        let reader = opened.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::audio(format!("{}: no audio track", path.display())))?;
        let params = &track.codec_params;

        let (encoding, big_endian, codec_bits) = describe_codec(params.codec)
            .ok_or_else(|| Error::audio(format!("{}: not a PCM stream", path.display())))?;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::audio(format!("{}: unknown sample rate", path.display())))?;
        let channels = params.channels.map(|c| c.count() as u32).unwrap_or(1);
        let bits_per_sample = params.bits_per_sample.unwrap_or(codec_bits);

        let format = AudioFormat {
            encoding,
            sample_rate: sample_rate as f32,
            bits_per_sample,
            channels,
            frame_size: channels * bits_per_sample.div_ceil(8),
            frame_rate: sample_rate as f32,
            big_endian,
        };

        Ok(Self {
            track_id: track.id,
            reader,
            format,
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Read the whole source, sending `chunk_size` pieces into `tx`.
    ///
    /// Blocking; run it on a blocking thread. The final chunk may be short.
    /// Returns early without error once the receiver is gone.
    pub fn pump(mut self, chunk_size: usize, tx: mpsc::Sender<Result<Vec<u8>>>) {
        let chunk_size = chunk_size.max(1);
        let mut pending = Vec::with_capacity(chunk_size);

        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(Error::audio(e.to_string())));
                    return;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let mut data = packet.buf();
            while !data.is_empty() {
                let take = (chunk_size - pending.len()).min(data.len());
                pending.extend_from_slice(&data[..take]);
                data = &data[take..];

                if pending.len() == chunk_size {
                    let chunk = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        return;
                    }
                }
            }
        }

        if !pending.is_empty() {
            let _ = tx.blocking_send(Ok(pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_wav;

    #[test]
    fn test_header_layout() {
        let format = AudioFormat {
            encoding: Encoding::PcmSigned,
            sample_rate: 44100.0,
            bits_per_sample: 16,
            channels: 2,
            frame_size: 4,
            frame_rate: 44100.0,
            big_endian: false,
        };
        assert_eq!(
            format.header(),
            "PCM_SIGNED\n44100.0\n16\n2\n4\n44100.0\nfalse\n"
        );
    }

    #[test]
    fn test_codec_mapping() {
        assert_eq!(
            describe_codec(CODEC_TYPE_PCM_S16BE),
            Some((Encoding::PcmSigned, true, 16))
        );
        assert_eq!(
            describe_codec(CODEC_TYPE_PCM_U8),
            Some((Encoding::PcmUnsigned, false, 8))
        );
        assert_eq!(describe_codec(CODEC_TYPE_NULL), None);
    }

    #[test]
    fn test_open_wav_reads_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Santana - Smooth - 143.wav");
        write_wav(&path, &[0u8; 400]);

        let source = AudioSource::open(&path).unwrap();
        let format = source.format();
        assert_eq!(format.encoding, Encoding::PcmSigned);
        assert_eq!(format.sample_rate, 44100.0);
        assert_eq!(format.bits_per_sample, 16);
        assert_eq!(format.channels, 2);
        assert_eq!(format.frame_size, 4);
        assert!(!format.big_endian);
    }

    #[test]
    fn test_open_rejects_non_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.wav");
        std::fs::write(&path, b"definitely not a riff file").unwrap();

        assert!(matches!(AudioSource::open(&path), Err(Error::Audio(_))));
    }

    #[test]
    fn test_pump_rechunks_all_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        write_wav(&path, &data);

        let source = AudioSource::open(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        source.pump(300, tx);

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk.unwrap());
        }
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![300, 300, 300, 100]);
        assert_eq!(chunks.concat(), data);
    }
}
