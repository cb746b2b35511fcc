use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr;

use x264_sys::*;

use crate::{Colorspace, Data, Error, Picture, Result, Setup};

/// An open libx264 encoder.
pub struct Encoder {
    raw: *mut x264_t,
    params: x264_param_t,
    colorspace: Colorspace,
}

// The handle is only ever used from one thread at a time.
unsafe impl Send for Encoder {}

impl Encoder {
    /// Creates a new builder seeded from a named preset.
    pub fn builder(preset: &str) -> Result<Setup> {
        Setup::preset(preset)
    }

    pub(crate) unsafe fn from_raw(raw: *mut x264_t, colorspace: Colorspace) -> Self {
        let mut params = MaybeUninit::<x264_param_t>::uninit();
        x264_encoder_parameters(raw, params.as_mut_ptr());
        Self {
            raw,
            params: params.assume_init(),
            colorspace,
        }
    }

    /// Fetches the out-of-band stream headers (SPS, PPS, SEI).
    ///
    /// Only meaningful before the first frame is submitted.
    pub fn headers(&mut self) -> Result<Data<'_>> {
        let mut len = 0;
        let mut nals: *mut x264_nal_t = ptr::null_mut();

        let err = unsafe { x264_encoder_headers(self.raw, &mut nals, &mut len) };
        if err < 0 {
            return Err(Error::Headers);
        }

        Ok(unsafe { Data::from_raw_parts(nals, len as usize) })
    }

    /// Feeds one packed frame to the encoder.
    ///
    /// `plane` must hold exactly `width * height * bytes_per_pixel` bytes in
    /// the configured colorspace, tightly packed in scanline order. The
    /// returned units stay valid until the next call on this encoder.
    pub fn encode(&mut self, pts: i64, picture: &mut Picture, plane: &[u8]) -> Result<Data<'_>> {
        let width = self.params.i_width as usize;
        let height = self.params.i_height as usize;
        let stride = width * self.colorspace.bytes_per_pixel();

        let expected = stride * height;
        if plane.len() != expected {
            return Err(Error::PlaneSize {
                got: plane.len(),
                expected,
            });
        }

        picture.raw.i_pts = pts;
        picture.raw.img.i_csp = self.colorspace.to_raw();
        picture.raw.img.i_plane = 1;
        picture.raw.img.i_stride[0] = stride as c_int;
        // libx264 only reads from the input planes.
        picture.raw.img.plane[0] = plane.as_ptr() as *mut u8;

        let mut len = 0;
        let mut nals: *mut x264_nal_t = ptr::null_mut();
        let mut pic_out = MaybeUninit::<x264_picture_t>::uninit();

        let err = unsafe {
            x264_encoder_encode(
                self.raw,
                &mut nals,
                &mut len,
                &mut picture.raw,
                pic_out.as_mut_ptr(),
            )
        };
        if err < 0 {
            return Err(Error::Encode);
        }

        Ok(unsafe { Data::from_raw_parts(nals, len as usize) })
    }

    /// Configured frame width in pixels.
    pub fn width(&self) -> u32 {
        self.params.i_width as u32
    }

    /// Configured frame height in pixels.
    pub fn height(&self) -> u32 {
        self.params.i_height as u32
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        unsafe {
            x264_encoder_close(self.raw);
        }
    }
}
