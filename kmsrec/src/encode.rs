//! The session-facing encoder: owns the x264 handle and its picture, hands
//! out SPS/PPS for the container, and turns captured RGB images into NALs.

use anyhow::{bail, Context, Result};
use x264::{Colorspace, Encoder, NalKind, Picture, Setup};

/// SPS and PPS payloads, kept for the codec private data.
pub struct CodecHeaders {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// One encoded unit with its payload copied out of the encoder.
pub struct EncodedNal {
    pub kind: NalKind,
    pub payload: Vec<u8>,
}

pub struct VideoEncoder {
    encoder: Encoder,
    picture: Picture,
}

impl VideoEncoder {
    /// Configures libx264 for packed-RGB screen content: fixed frame rate
    /// timestamps, headers out of band, Annex-B framing, high 4:4:4 profile.
    pub fn new(preset: &str, width: u32, height: u32) -> Result<Self> {
        let encoder = Setup::preset(preset)?
            .bitdepth(8)
            .colorspace(Colorspace::Rgb)
            .dimensions(width, height)
            .vfr_input(false)
            .repeat_headers(false)
            .annexb(true)
            .profile("high444")?
            .build()?;

        Ok(Self {
            encoder,
            picture: Picture::new(),
        })
    }

    /// Fetches the out-of-band SPS and PPS. Call before the first frame.
    pub fn headers(&mut self) -> Result<CodecHeaders> {
        let data = self
            .encoder
            .headers()
            .context("couldn't fetch encoder headers")?;

        let mut sps = None;
        let mut pps = None;
        for nal in data.iter() {
            match nal.kind() {
                NalKind::Sps => sps = Some(nal.payload().to_vec()),
                NalKind::Pps => pps = Some(nal.payload().to_vec()),
                _ => {}
            }
        }

        match (sps, pps) {
            (Some(sps), Some(pps)) => Ok(CodecHeaders { sps, pps }),
            _ => bail!("encoder produced no SPS/PPS"),
        }
    }

    /// Submits one packed RGB frame; returns zero or more NALs.
    pub fn encode(&mut self, rgb: &[u8], pts: i64) -> Result<Vec<EncodedNal>> {
        let data = self.encoder.encode(pts, &mut self.picture, rgb)?;

        Ok(data
            .iter()
            .map(|nal| EncodedNal {
                kind: nal.kind(),
                payload: nal.payload().to_vec(),
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Needs a system libx264.
    #[test]
    #[ignore]
    fn encode_gray_frames() {
        let (w, h) = (64u32, 48u32);
        let mut encoder = VideoEncoder::new("ultrafast", w, h).unwrap();

        let headers = encoder.headers().unwrap();
        assert!(!headers.sps.is_empty());
        assert!(!headers.pps.is_empty());

        let frame = vec![0x80u8; (w * h * 3) as usize];
        let mut saw_idr = false;
        for pts in 0..30 {
            for nal in encoder.encode(&frame, pts).unwrap() {
                assert!(!nal.payload.is_empty());
                saw_idr |= nal.kind == NalKind::Idr;
            }
        }
        assert!(saw_idr);
    }
}
