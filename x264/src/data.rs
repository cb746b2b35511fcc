use std::marker::PhantomData;
use std::os::raw::c_int;
use std::slice;

use x264_sys::*;

/// The class of a NAL unit, as far as the muxer cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// Instantaneous decoder refresh slice (a keyframe).
    Idr,
    /// Any non-IDR slice.
    Slice,
    /// Supplemental enhancement information.
    Sei,
    /// Everything else (AUD, filler, ...).
    Other,
}

impl NalKind {
    fn from_raw(raw: c_int) -> Self {
        match raw as nal_unit_type_e {
            nal_unit_type_e_NAL_SPS => NalKind::Sps,
            nal_unit_type_e_NAL_PPS => NalKind::Pps,
            nal_unit_type_e_NAL_SLICE_IDR => NalKind::Idr,
            nal_unit_type_e_NAL_SLICE
            | nal_unit_type_e_NAL_SLICE_DPA
            | nal_unit_type_e_NAL_SLICE_DPB
            | nal_unit_type_e_NAL_SLICE_DPC => NalKind::Slice,
            nal_unit_type_e_NAL_SEI => NalKind::Sei,
            _ => NalKind::Other,
        }
    }
}

/// One NAL unit borrowed from the encoder's output buffer.
#[derive(Clone, Copy)]
pub struct Nal<'a> {
    kind: NalKind,
    payload: &'a [u8],
}

impl<'a> Nal<'a> {
    /// What kind of unit this is.
    pub fn kind(&self) -> NalKind {
        self.kind
    }

    /// The unit bytes, framed exactly as the encoder produced them.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// Encoder output: zero or more NAL units, valid until the next encoder call.
pub struct Data<'a> {
    ptr: *mut x264_nal_t,
    len: usize,
    _encoder: PhantomData<&'a mut ()>,
}

impl<'a> Data<'a> {
    pub(crate) unsafe fn from_raw_parts(ptr: *mut x264_nal_t, len: usize) -> Self {
        Self {
            ptr,
            len,
            _encoder: PhantomData,
        }
    }

    /// Number of NAL units produced.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the encoder produced no output for this call.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `i`-th unit.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn nal(&self, i: usize) -> Nal<'a> {
        assert!(i < self.len, "NAL index {} out of range {}", i, self.len);

        unsafe {
            let raw = &*self.ptr.add(i);
            Nal {
                kind: NalKind::from_raw(raw.i_type),
                payload: slice::from_raw_parts(raw.p_payload, raw.i_payload as usize),
            }
        }
    }

    /// Iterates over the units in order.
    pub fn iter(&self) -> impl Iterator<Item = Nal<'a>> + '_ {
        (0..self.len).map(move |i| self.nal(i))
    }
}
