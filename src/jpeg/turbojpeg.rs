// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FFI bindings to libjpeg-turbo's TurboJPEG API.
//!
//! A thin safe wrapper over `tjCompress2` for the Tight encoder's JPEG
//! mode. Input is tightly packed RGB; chrominance is subsampled 4:2:2.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong};

/// RGB pixel format (red, green, blue).
const TJPF_RGB: c_int = 0;

/// 4:2:2 chrominance subsampling.
const TJSAMP_422: c_int = 1;

type TjHandle = *mut c_void;

#[link(name = "turbojpeg")]
extern "C" {
    fn tjInitCompress() -> TjHandle;
    fn tjDestroy(handle: TjHandle) -> c_int;
    fn tjCompress2(
        handle: TjHandle,
        src_buf: *const c_uchar,
        width: c_int,
        pitch: c_int,
        height: c_int,
        pixel_format: c_int,
        jpeg_buf: *mut *mut c_uchar,
        jpeg_size: *mut c_ulong,
        jpeg_subsamp: c_int,
        jpeg_qual: c_int,
        flags: c_int,
    ) -> c_int;
    fn tjFree(buffer: *mut c_uchar);
    fn tjGetErrorStr2(handle: TjHandle) -> *const c_char;
}

/// Safe wrapper for TurboJPEG compression.
pub struct TurboJpegEncoder {
    handle: TjHandle,
}

impl TurboJpegEncoder {
    /// Creates a new compressor handle.
    ///
    /// # Errors
    ///
    /// Returns an error when libjpeg-turbo fails to initialise.
    pub fn new() -> Result<Self, String> {
        let handle = unsafe { tjInitCompress() };
        if handle.is_null() {
            return Err("Failed to initialize TurboJPEG compressor".to_string());
        }
        Ok(Self { handle })
    }

    /// Compresses packed RGB data (3 bytes per pixel) to JPEG.
    ///
    /// # Errors
    ///
    /// Returns an error for a size mismatch or a compression failure.
    pub fn compress_rgb(
        &mut self,
        rgb_data: &[u8],
        width: u16,
        height: u16,
        quality: u8,
    ) -> Result<Vec<u8>, String> {
        let expected_size = usize::from(width) * usize::from(height) * 3;
        if rgb_data.len() != expected_size {
            return Err(format!(
                "Invalid RGB data size: expected {}, got {}",
                expected_size,
                rgb_data.len()
            ));
        }

        let mut jpeg_buf: *mut c_uchar = std::ptr::null_mut();
        let mut jpeg_size: c_ulong = 0;

        let result = unsafe {
            tjCompress2(
                self.handle,
                rgb_data.as_ptr(),
                c_int::from(width),
                0, // pitch 0 means width * pixel size
                c_int::from(height),
                TJPF_RGB,
                &mut jpeg_buf,
                &mut jpeg_size,
                TJSAMP_422,
                c_int::from(quality),
                0,
            )
        };

        if result != 0 {
            return Err(format!(
                "TurboJPEG compression failed: {}",
                self.error_string()
            ));
        }
        if jpeg_buf.is_null() {
            return Err("TurboJPEG returned null buffer".to_string());
        }

        let jpeg_data =
            unsafe { std::slice::from_raw_parts(jpeg_buf, jpeg_size as usize).to_vec() };
        unsafe {
            tjFree(jpeg_buf);
        }

        Ok(jpeg_data)
    }

    fn error_string(&self) -> String {
        unsafe {
            let c_str = tjGetErrorStr2(self.handle);
            if c_str.is_null() {
                return "Unknown error".to_string();
            }
            std::ffi::CStr::from_ptr(c_str).to_string_lossy().into_owned()
        }
    }
}

impl Drop for TurboJpegEncoder {
    fn drop(&mut self) {
        unsafe {
            tjDestroy(self.handle);
        }
    }
}

unsafe impl Send for TurboJpegEncoder {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_produces_jpeg_magic() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        let rgb_data = vec![255, 0, 0, 255, 0, 0, 255, 0, 0, 255, 0, 0];
        let jpeg_data = encoder.compress_rgb(&rgb_data, 2, 2, 90).unwrap();
        assert_eq!(&jpeg_data[..2], &[0xFF, 0xD8]);
    }
}
