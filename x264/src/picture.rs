use std::mem::MaybeUninit;

use x264_sys::*;

/// Input/output picture metadata handed to `x264_encoder_encode`.
pub struct Picture {
    pub(crate) raw: x264_picture_t,
}

impl Picture {
    /// Creates an initialized picture with no planes attached.
    pub fn new() -> Self {
        unsafe {
            let mut raw = MaybeUninit::<x264_picture_t>::uninit();
            x264_picture_init(raw.as_mut_ptr());
            Self {
                raw: raw.assume_init(),
            }
        }
    }

    /// The presentation timestamp of the last submitted frame.
    pub fn pts(&self) -> i64 {
        self.raw.i_pts
    }
}

impl Default for Picture {
    fn default() -> Self {
        Self::new()
    }
}
