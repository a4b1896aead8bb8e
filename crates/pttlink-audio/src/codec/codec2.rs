use std::ffi::c_void;
use std::path::Path;

use anyhow::{Context, Result};
use libloading::Library;

/// libcodec2 mode constants for the supported bitrates.
fn mode_for_bitrate(bitrate: u32) -> i32 {
    match bitrate {
        3200 => 0,
        2400 => 1,
        1600 => 2,
        700 => 8,
        _ => 10, // 450
    }
}

type CreateFn = unsafe extern "C" fn(i32) -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type IntQueryFn = unsafe extern "C" fn(*mut c_void) -> i32;
type EncodeFn = unsafe extern "C" fn(*mut c_void, *mut u8, *mut i16);
type DecodeFn = unsafe extern "C" fn(*mut c_void, *mut i16, *const u8);

/// Codec2 backend loaded at runtime from a user-supplied libcodec2.
///
/// The raw codec state is only ever touched under the engine's mutex.
pub struct Codec2Codec {
    state: *mut c_void,
    destroy: DestroyFn,
    encode: EncodeFn,
    decode: DecodeFn,
    samples_per_frame: usize,
    frame_bytes: usize,
    // Keeps the loaded library (and the fn pointers above) alive.
    _lib: Library,
}

unsafe impl Send for Codec2Codec {}

impl Codec2Codec {
    pub fn load(path: &Path, bitrate: u32) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load codec2 library {}", path.display()))?;

        unsafe {
            let create: CreateFn = *lib
                .get(b"codec2_create\0")
                .context("codec2_create symbol missing")?;
            let destroy: DestroyFn = *lib
                .get(b"codec2_destroy\0")
                .context("codec2_destroy symbol missing")?;
            let samples_fn: IntQueryFn = *lib
                .get(b"codec2_samples_per_frame\0")
                .context("codec2_samples_per_frame symbol missing")?;
            let bits_fn: IntQueryFn = *lib
                .get(b"codec2_bits_per_frame\0")
                .context("codec2_bits_per_frame symbol missing")?;
            let encode: EncodeFn = *lib
                .get(b"codec2_encode\0")
                .context("codec2_encode symbol missing")?;
            let decode: DecodeFn = *lib
                .get(b"codec2_decode\0")
                .context("codec2_decode symbol missing")?;

            let state = create(mode_for_bitrate(bitrate));
            anyhow::ensure!(!state.is_null(), "codec2_create returned null");

            let samples_per_frame = samples_fn(state) as usize;
            let frame_bytes = (bits_fn(state) as usize + 7) / 8;
            anyhow::ensure!(
                samples_per_frame > 0 && frame_bytes > 0,
                "codec2 reported empty frame geometry"
            );

            Ok(Self {
                state,
                destroy,
                encode,
                decode,
                samples_per_frame,
                frame_bytes,
                _lib: lib,
            })
        }
    }

    /// Encoded frame size in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// PCM frame size in bytes (s16le at 8 kHz).
    pub fn pcm_frame_bytes(&self) -> usize {
        self.samples_per_frame * 2
    }

    /// Frame duration at the 8 kHz pipeline rate.
    pub fn frame_ms(&self) -> u64 {
        (self.samples_per_frame as u64 * 1000) / 8000
    }

    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            pcm.len() == self.pcm_frame_bytes(),
            "codec2 encode expects {} bytes, got {}",
            self.pcm_frame_bytes(),
            pcm.len()
        );

        let mut samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let mut out = vec![0u8; self.frame_bytes];
        unsafe {
            (self.encode)(self.state, out.as_mut_ptr(), samples.as_mut_ptr());
        }
        Ok(out)
    }

    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            frame.len() == self.frame_bytes,
            "codec2 decode expects {} bytes, got {}",
            self.frame_bytes,
            frame.len()
        );

        let mut samples = vec![0i16; self.samples_per_frame];
        unsafe {
            (self.decode)(self.state, samples.as_mut_ptr(), frame.as_ptr());
        }
        Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}

impl Drop for Codec2Codec {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.state) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fails_cleanly_for_missing_library() {
        let err = Codec2Codec::load(Path::new("/nonexistent/libcodec2.so"), 1600)
            .err()
            .expect("load must fail");
        assert!(err.to_string().contains("libcodec2.so"));
    }

    #[test]
    fn bitrates_map_to_native_modes() {
        assert_eq!(mode_for_bitrate(3200), 0);
        assert_eq!(mode_for_bitrate(2400), 1);
        assert_eq!(mode_for_bitrate(1600), 2);
        assert_eq!(mode_for_bitrate(700), 8);
        assert_eq!(mode_for_bitrate(450), 10);
    }
}
