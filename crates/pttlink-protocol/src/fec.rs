//! (k, 2) parity FEC over GF(2⁸).
//!
//! Audio frames are grouped into fixed-size blocks keyed by
//! `block_start = audio_seq - (audio_seq mod block_size)`. Each block
//! produces two parities: `P = ⊕ frame_i` and `Q = ⊕ frame_i · α^i` with
//! α = 2, which lets the decoder recover any two lost frames per block.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use tracing::trace;

use crate::messages::FecPayload;

/// Default number of audio frames per FEC block.
pub const DEFAULT_BLOCK_SIZE: usize = 6;

/// Maximum number of open (incomplete) blocks the decoder retains.
const MAX_OPEN_BLOCKS: usize = 24;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

static TABLES: OnceLock<GfTables> = OnceLock::new();

/// GF(2⁸) generated by x⁸ + x⁴ + x³ + x² + 1 (0x11d).
fn gf_tables() -> &'static GfTables {
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u32 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11d;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = gf_tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_div(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = gf_tables();
    let mut diff = t.log[a as usize] as i32 - t.log[b as usize] as i32;
    if diff < 0 {
        diff += 255;
    }
    t.exp[diff as usize]
}

fn gf_pow2(exp: i32) -> u8 {
    let e = exp.rem_euclid(255);
    gf_tables().exp[e as usize]
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn xor_mul_into(dst: &mut [u8], src: &[u8], factor: u8) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= gf_mul(*s, factor);
    }
}

/// A frame produced by the decoder, keyed by its audio sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecDecodedFrame {
    pub seq: u16,
    pub frame: Vec<u8>,
}

/// Sender-side parity accumulator.
///
/// Frames must share one size within a block; a size change or a block
/// boundary jump restarts the accumulator.
#[derive(Debug)]
pub struct FecEncoder {
    enabled: bool,
    block_size: usize,
    frame_size: usize,
    block_start: u16,
    in_block: usize,
    parity_p: Vec<u8>,
    parity_q: Vec<u8>,
}

impl Default for FecEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FecEncoder {
    pub fn new() -> Self {
        Self {
            enabled: false,
            block_size: DEFAULT_BLOCK_SIZE,
            frame_size: 0,
            block_start: 0,
            in_block: 0,
            parity_p: Vec::new(),
            parity_q: Vec::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.reset();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        if block_size == 0 || self.block_size == block_size {
            return;
        }
        self.block_size = block_size;
        self.reset();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn reset(&mut self) {
        self.frame_size = 0;
        self.block_start = 0;
        self.in_block = 0;
        self.parity_p.clear();
        self.parity_q.clear();
    }

    /// Fold one audio frame into the current block. Returns the block's
    /// two parity packets when the block completes, empty otherwise.
    pub fn add_frame(&mut self, audio_seq: u16, frame: &[u8]) -> Vec<FecPayload> {
        if !self.enabled || frame.is_empty() || self.block_size == 0 {
            return Vec::new();
        }

        let index = audio_seq as usize % self.block_size;
        let block_start = audio_seq - index as u16;

        if self.in_block == 0 || frame.len() != self.frame_size || block_start != self.block_start
        {
            self.begin_block(block_start, frame.len());
        }

        xor_into(&mut self.parity_p, frame);
        xor_mul_into(&mut self.parity_q, frame, gf_pow2(index as i32));

        self.in_block += 1;
        if self.in_block < self.block_size {
            return Vec::new();
        }

        let out = vec![
            FecPayload {
                block_start: self.block_start,
                block_size: self.block_size as u8,
                parity_index: 0,
                parity: std::mem::take(&mut self.parity_p),
            },
            FecPayload {
                block_start: self.block_start,
                block_size: self.block_size as u8,
                parity_index: 1,
                parity: std::mem::take(&mut self.parity_q),
            },
        ];
        self.in_block = 0;
        out
    }

    fn begin_block(&mut self, block_start: u16, frame_size: usize) {
        self.block_start = block_start;
        self.in_block = 0;
        self.frame_size = frame_size;
        self.parity_p = vec![0; frame_size];
        self.parity_q = vec![0; frame_size];
    }
}

#[derive(Debug)]
struct Block {
    start: u16,
    block_size: usize,
    frame_size: usize,
    data: Vec<Vec<u8>>,
    present: Vec<bool>,
    parity: [Vec<u8>; 2],
    parity_present: [bool; 2],
}

impl Block {
    fn new(start: u16, block_size: usize, frame_size: usize) -> Self {
        Self {
            start,
            block_size,
            frame_size,
            data: vec![Vec::new(); block_size],
            present: vec![false; block_size],
            parity: [Vec::new(), Vec::new()],
            parity_present: [false, false],
        }
    }

    fn missing_indexes(&self) -> Vec<usize> {
        (0..self.block_size).filter(|&i| !self.present[i]).collect()
    }

    fn recoverable(&self, missing: usize) -> bool {
        match missing {
            0 => true,
            1 => self.parity_present[0] || self.parity_present[1],
            2 => self.parity_present[0] && self.parity_present[1],
            _ => false,
        }
    }
}

/// Receiver-side parity decoder.
///
/// With FEC disabled, data frames pass through verbatim and parity is
/// discarded.
#[derive(Debug)]
pub struct FecDecoder {
    enabled: bool,
    block_size: usize,
    blocks: BTreeMap<u16, Block>,
}

impl Default for FecDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FecDecoder {
    pub fn new() -> Self {
        Self {
            enabled: false,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks: BTreeMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.reset();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        if block_size == 0 || self.block_size == block_size {
            return;
        }
        self.block_size = block_size;
        self.reset();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
    }

    /// Number of incomplete blocks currently retained.
    pub fn open_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Record an arrived data frame and return any frames recovery
    /// produces. When disabled the frame itself is passed through.
    pub fn push_data(&mut self, audio_seq: u16, frame: &[u8]) -> Vec<FecDecodedFrame> {
        if !self.enabled {
            return vec![FecDecodedFrame {
                seq: audio_seq,
                frame: frame.to_vec(),
            }];
        }

        if frame.is_empty() || self.block_size == 0 {
            return Vec::new();
        }

        let index = audio_seq as usize % self.block_size;
        let block_start = audio_seq - index as u16;

        let block = self.ensure_block(block_start, frame.len());
        if index < block.data.len() {
            block.data[index] = frame.to_vec();
            block.present[index] = true;
        }

        self.try_output()
    }

    /// Record an arrived parity packet. Parity whose block size disagrees
    /// with the configured value is rejected.
    pub fn push_parity(
        &mut self,
        block_start: u16,
        block_size: u8,
        parity_index: u8,
        data: &[u8],
    ) -> Vec<FecDecodedFrame> {
        if !self.enabled {
            return Vec::new();
        }
        if block_size as usize != self.block_size || parity_index > 1 {
            return Vec::new();
        }

        let block = self.ensure_block(block_start, data.len());
        if block.frame_size != data.len() {
            block.frame_size = data.len();
        }
        block.parity[parity_index as usize] = data.to_vec();
        block.parity_present[parity_index as usize] = true;

        self.try_output()
    }

    fn ensure_block(&mut self, block_start: u16, frame_size: usize) -> &mut Block {
        if let Some(block) = self.blocks.get(&block_start) {
            if block.frame_size != frame_size && frame_size > 0 && block.frame_size > 0 {
                self.blocks.remove(&block_start);
            }
        }

        let block_size = self.block_size;
        let block = self
            .blocks
            .entry(block_start)
            .or_insert_with(|| Block::new(block_start, block_size, frame_size));
        if frame_size > 0 && block.frame_size == 0 {
            block.frame_size = frame_size;
        }
        block
    }

    fn try_output(&mut self) -> Vec<FecDecodedFrame> {
        let mut out = Vec::new();
        let mut completed = Vec::new();

        for (&key, block) in self.blocks.iter_mut() {
            let missing = block.missing_indexes();
            if block.recoverable(missing.len()) && !missing.is_empty() {
                out.extend(recover_block(block, &missing));
            }
            if block.missing_indexes().is_empty() {
                completed.push(key);
            }
        }

        for key in completed {
            self.blocks.remove(&key);
        }
        while self.blocks.len() > MAX_OPEN_BLOCKS {
            self.blocks.pop_first();
        }

        if !out.is_empty() {
            trace!(frames = out.len(), "recovered lost frames from parity");
        }
        out
    }
}

/// Solve for the block's missing frames and return them in sequence order.
fn recover_block(block: &mut Block, missing: &[usize]) -> Vec<FecDecodedFrame> {
    let frame_size = block.frame_size;
    if frame_size == 0 || block.block_size == 0 {
        return Vec::new();
    }

    let mut sum_p = vec![0u8; frame_size];
    let mut sum_q = vec![0u8; frame_size];
    for i in 0..block.block_size {
        if !block.present[i] {
            continue;
        }
        xor_into(&mut sum_p, &block.data[i]);
        xor_mul_into(&mut sum_q, &block.data[i], gf_pow2(i as i32));
    }

    match missing {
        [mi] => {
            let mut recovered;
            if block.parity_present[0] {
                recovered = block.parity[0].clone();
                recovered.resize(frame_size, 0);
                xor_into(&mut recovered, &sum_p);
            } else {
                recovered = block.parity[1].clone();
                recovered.resize(frame_size, 0);
                xor_into(&mut recovered, &sum_q);
                let coef = gf_pow2(*mi as i32);
                for b in recovered.iter_mut() {
                    *b = gf_div(*b, coef);
                }
            }
            block.data[*mi] = recovered;
            block.present[*mi] = true;
        }
        [mi, mj] => {
            let mut s = block.parity[0].clone();
            s.resize(frame_size, 0);
            xor_into(&mut s, &sum_p);

            let mut t = block.parity[1].clone();
            t.resize(frame_size, 0);
            xor_into(&mut t, &sum_q);

            let gi = gf_pow2(*mi as i32);
            let gj = gf_pow2(*mj as i32);
            let denom = gi ^ gj;
            if denom != 0 {
                let mut di = vec![0u8; frame_size];
                for b in 0..frame_size {
                    let numerator = t[b] ^ gf_mul(s[b], gj);
                    di[b] = gf_div(numerator, denom);
                }
                let mut dj = di.clone();
                xor_into(&mut dj, &s);

                block.data[*mi] = di;
                block.data[*mj] = dj;
                block.present[*mi] = true;
                block.present[*mj] = true;
            }
        }
        _ => {}
    }

    missing
        .iter()
        .filter(|&&idx| block.present[idx] && !block.data[idx].is_empty())
        .map(|&idx| FecDecodedFrame {
            seq: block.start.wrapping_add(idx as u16),
            frame: block.data[idx].clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
    }

    fn block_frames(len: usize) -> Vec<Vec<u8>> {
        (0..DEFAULT_BLOCK_SIZE as u8).map(|i| frame(i + 1, len)).collect()
    }

    fn encode_block(frames: &[Vec<u8>]) -> Vec<FecPayload> {
        let mut enc = FecEncoder::new();
        enc.set_enabled(true);
        let mut parities = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            parities.extend(enc.add_frame(i as u16, f));
        }
        parities
    }

    #[test]
    fn gf_field_properties() {
        // α has full multiplicative order and division inverts multiplication.
        for a in 1..=255u8 {
            for &b in &[1u8, 2, 7, 0x80, 0xFF] {
                assert_eq!(gf_div(gf_mul(a, b), b), a);
            }
        }
        assert_eq!(gf_mul(0, 0x53), 0);
        assert_eq!(gf_pow2(0), 1);
        assert_eq!(gf_pow2(255), 1);
    }

    #[test]
    fn encoder_emits_two_parities_per_block() {
        let frames = block_frames(12);
        let parities = encode_block(&frames);
        assert_eq!(parities.len(), 2);
        assert_eq!(parities[0].parity_index, 0);
        assert_eq!(parities[1].parity_index, 1);
        assert_eq!(parities[0].block_start, 0);
        assert_eq!(parities[0].parity.len(), 12);
    }

    #[test]
    fn encoder_disabled_produces_nothing() {
        let enc_out = FecEncoder::new().add_frame(0, &frame(1, 8));
        assert!(enc_out.is_empty());
    }

    #[test]
    fn encoder_restarts_block_on_frame_size_change() {
        let mut enc = FecEncoder::new();
        enc.set_enabled(true);
        enc.add_frame(0, &frame(1, 8));
        enc.add_frame(1, &frame(2, 8));
        // Size change restarts the block at index 2's block start.
        let out: Vec<_> = (2..8)
            .flat_map(|i| enc.add_frame(i as u16, &frame(i as u8, 16)))
            .collect();
        // Frames 2..8 cross the 0..6 / 6..12 boundary, restarting again;
        // no block ever completes.
        assert!(out.is_empty());
    }

    #[test]
    fn decoder_passthrough_when_disabled() {
        let mut dec = FecDecoder::new();
        let out = dec.push_data(17, &frame(1, 8));
        assert_eq!(out, vec![FecDecodedFrame { seq: 17, frame: frame(1, 8) }]);
        assert!(dec.push_parity(12, 6, 0, &frame(2, 8)).is_empty());
    }

    #[test]
    fn recovers_single_loss_with_p_parity() {
        let frames = block_frames(10);
        let parities = encode_block(&frames);

        let mut dec = FecDecoder::new();
        dec.set_enabled(true);
        let mut recovered = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            if i == 3 {
                continue;
            }
            recovered.extend(dec.push_data(i as u16, f));
        }
        let p = &parities[0];
        recovered.extend(dec.push_parity(p.block_start, p.block_size, p.parity_index, &p.parity));

        assert_eq!(recovered, vec![FecDecodedFrame { seq: 3, frame: frames[3].clone() }]);
        assert_eq!(dec.open_blocks(), 0);
    }

    #[test]
    fn recovers_single_loss_with_q_parity_only() {
        let frames = block_frames(10);
        let parities = encode_block(&frames);

        let mut dec = FecDecoder::new();
        dec.set_enabled(true);
        let q = &parities[1];
        dec.push_parity(q.block_start, q.block_size, q.parity_index, &q.parity);

        let mut recovered = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            if i == 5 {
                continue;
            }
            recovered.extend(dec.push_data(i as u16, f));
        }

        assert_eq!(recovered, vec![FecDecodedFrame { seq: 5, frame: frames[5].clone() }]);
    }

    #[test]
    fn recovers_any_two_losses() {
        // Property: losing any ≤2 of the k+2 transmitted packets still
        // yields every data frame byte-for-byte.
        let frames = block_frames(14);
        let parities = encode_block(&frames);
        let total = frames.len() + 2;

        for lost_a in 0..total {
            for lost_b in lost_a + 1..total {
                let mut dec = FecDecoder::new();
                dec.set_enabled(true);

                let mut seen: Vec<FecDecodedFrame> = Vec::new();
                for (i, f) in frames.iter().enumerate() {
                    if i == lost_a || i == lost_b {
                        continue;
                    }
                    seen.push(FecDecodedFrame { seq: i as u16, frame: f.clone() });
                    seen.extend(dec.push_data(i as u16, f));
                }
                for (pi, p) in parities.iter().enumerate() {
                    if frames.len() + pi == lost_a || frames.len() + pi == lost_b {
                        continue;
                    }
                    seen.extend(dec.push_parity(
                        p.block_start,
                        p.block_size,
                        p.parity_index,
                        &p.parity,
                    ));
                }

                for (i, f) in frames.iter().enumerate() {
                    let got = seen.iter().find(|d| d.seq == i as u16).unwrap_or_else(|| {
                        panic!("frame {i} not produced losing ({lost_a},{lost_b})")
                    });
                    assert_eq!(&got.frame, f, "frame {i} losing ({lost_a},{lost_b})");
                }
            }
        }
    }

    #[test]
    fn three_losses_are_not_recoverable() {
        let frames = block_frames(8);
        let parities = encode_block(&frames);

        let mut dec = FecDecoder::new();
        dec.set_enabled(true);
        let mut recovered = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            if i < 3 {
                continue;
            }
            recovered.extend(dec.push_data(i as u16, f));
        }
        for p in &parities {
            recovered.extend(dec.push_parity(p.block_start, p.block_size, p.parity_index, &p.parity));
        }
        assert!(recovered.is_empty());
        assert_eq!(dec.open_blocks(), 1);
    }

    #[test]
    fn rejects_parity_with_mismatched_block_size() {
        let mut dec = FecDecoder::new();
        dec.set_enabled(true);
        assert!(dec.push_parity(0, 4, 0, &frame(1, 8)).is_empty());
        assert_eq!(dec.open_blocks(), 0);
    }

    #[test]
    fn bounds_open_blocks() {
        let mut dec = FecDecoder::new();
        dec.set_enabled(true);
        // One lone frame per block, far more blocks than the retention cap.
        for b in 0..40u16 {
            dec.push_data(b * DEFAULT_BLOCK_SIZE as u16, &frame(b as u8, 8));
        }
        assert!(dec.open_blocks() <= 24);
    }

    #[test]
    fn block_boundaries_derive_from_sequence_truncation() {
        let mut enc = FecEncoder::new();
        enc.set_enabled(true);
        // Sequences 100..106: 100 sits at index 4 of block 96, so the
        // first completed block is 102..108.
        let mut parities = Vec::new();
        for seq in 100..108u16 {
            parities.extend(enc.add_frame(seq, &frame(seq as u8, 8)));
        }
        assert_eq!(parities.len(), 2);
        assert_eq!(parities[0].block_start, 102);
    }
}
