//! JPEG compression for the Tight encoding.
//!
//! TurboJPEG support is optional and enabled with the `turbojpeg`
//! feature; without it the Tight encoder sends full-colour rectangles
//! instead of JPEG.

#[cfg(feature = "turbojpeg")]
pub mod turbojpeg;

#[cfg(feature = "turbojpeg")]
pub use turbojpeg::TurboJpegEncoder;
