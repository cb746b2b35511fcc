use std::ffi::CString;
use std::mem;
use std::os::raw::c_int;
use std::ptr;

use x264_sys::*;

use crate::{Colorspace, Encoder, Error, Result};

/// Builds an [`Encoder`] from a named preset plus explicit overrides.
///
/// The builder mirrors the order libx264 expects: defaults from the preset
/// first, then individual parameters, then the profile, which must be applied
/// last because it constrains the parameters chosen before it.
pub struct Setup {
    raw: x264_param_t,
    colorspace: Colorspace,
}

impl Setup {
    /// Starts from a named libx264 preset ("ultrafast" .. "placebo").
    pub fn preset(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| Error::Preset(name.to_owned()))?;
        let mut raw: x264_param_t = unsafe { mem::zeroed() };

        let err =
            unsafe { x264_param_default_preset(&mut raw, c_name.as_ptr(), ptr::null()) };
        if err < 0 {
            return Err(Error::Preset(name.to_owned()));
        }

        Ok(Self {
            raw,
            colorspace: Colorspace::Rgb,
        })
    }

    /// Bit depth of the input samples.
    pub fn bitdepth(mut self, bits: u32) -> Self {
        self.raw.i_bitdepth = bits as c_int;
        self
    }

    /// Input colorspace.
    pub fn colorspace(mut self, csp: Colorspace) -> Self {
        self.colorspace = csp;
        self.raw.i_csp = csp.to_raw();
        self
    }

    /// Frame geometry in pixels.
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.raw.i_width = width as c_int;
        self.raw.i_height = height as c_int;
        self
    }

    /// Whether input timestamps are variable-frame-rate.
    pub fn vfr_input(mut self, vfr: bool) -> Self {
        self.raw.b_vfr_input = vfr as c_int;
        self
    }

    /// Whether SPS/PPS are repeated in front of every keyframe.
    pub fn repeat_headers(mut self, repeat: bool) -> Self {
        self.raw.b_repeat_headers = repeat as c_int;
        self
    }

    /// Whether NAL units carry Annex-B start codes.
    pub fn annexb(mut self, annexb: bool) -> Self {
        self.raw.b_annexb = annexb as c_int;
        self
    }

    /// Applies a named profile ("baseline", "high", "high444", ...).
    ///
    /// Must be the last configuration step before [`Setup::build`].
    pub fn profile(mut self, name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| Error::Profile(name.to_owned()))?;

        let err = unsafe { x264_param_apply_profile(&mut self.raw, c_name.as_ptr()) };
        if err < 0 {
            return Err(Error::Profile(name.to_owned()));
        }

        Ok(self)
    }

    /// Opens the encoder.
    pub fn build(mut self) -> Result<Encoder> {
        let raw = unsafe { x264_encoder_open_shim(&mut self.raw) };
        if raw.is_null() {
            return Err(Error::Open);
        }

        Ok(unsafe { Encoder::from_raw(raw, self.colorspace) })
    }
}
