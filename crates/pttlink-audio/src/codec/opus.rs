use anyhow::Result;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::packet::Packet;
use audiopus::{Application, Channels, MutSignals, SampleRate, Signal};

use crate::PCM_FRAME_BYTES;

/// Samples per 20 ms pipeline frame.
const FRAME_SAMPLES: usize = PCM_FRAME_BYTES / 2;

/// Opus narrowband backend: 8 kHz mono, hard CBR so every encoded frame
/// has the size the wire format and FEC blocks expect.
pub struct OpusCodec {
    encoder: OpusEncoder,
    decoder: OpusDecoder,
    frame_bytes: usize,
}

impl OpusCodec {
    pub fn new(bitrate: u32) -> Result<Self> {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz8000, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(audiopus::Bitrate::BitsPerSecond(bitrate as i32))?;
        encoder.set_vbr(false)?;
        encoder.set_signal(Signal::Voice)?;

        let decoder = OpusDecoder::new(SampleRate::Hz8000, Channels::Mono)?;

        // CBR frame size: bitrate over 50 frames/s, bounded to sane sizes.
        let frame_bytes = (bitrate as usize / 400).clamp(8, 512);

        Ok(Self {
            encoder,
            decoder,
            frame_bytes,
        })
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Encode one 160-sample s16le frame.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>> {
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        anyhow::ensure!(
            samples.len() == FRAME_SAMPLES,
            "opus encode expects {} samples, got {}",
            FRAME_SAMPLES,
            samples.len()
        );

        let mut output = vec![0u8; 512];
        let len = self.encoder.encode(&samples, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode one Opus frame back to s16le PCM.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0i16; FRAME_SAMPLES];
        let packet = Packet::try_from(frame)?;
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.decoder.decode(Some(packet), signals, false)?;
        output.truncate(samples);
        Ok(output.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}
