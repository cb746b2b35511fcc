use std::os::raw::c_int;

use x264_sys::*;

/// Packed single-plane input colorspaces supported by the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    /// Packed 24-bit B,G,R.
    Bgr,
    /// Packed 32-bit B,G,R,A.
    Bgra,
    /// Packed 24-bit R,G,B.
    Rgb,
}

impl Colorspace {
    pub(crate) fn to_raw(self) -> c_int {
        (match self {
            Colorspace::Bgr => X264_CSP_BGR,
            Colorspace::Bgra => X264_CSP_BGRA,
            Colorspace::Rgb => X264_CSP_RGB,
        }) as c_int
    }

    /// Bytes per pixel, which is also the stride divisor.
    pub(crate) fn bytes_per_pixel(self) -> usize {
        match self {
            Colorspace::Bgr | Colorspace::Rgb => 3,
            Colorspace::Bgra => 4,
        }
    }
}
