//! Single-frame capture, written as binary PPM.

use std::io::Write;

use anyhow::{Context, Result};

use crate::cli::GeometrySpec;
use crate::detile::{self, PixelLayout};
use crate::drm::ScanoutSource;

/// Writes `P6\n<w>\n<h>\n255\n` followed by packed R,G,B scanlines.
pub fn write_ppm(out: &mut impl Write, width: usize, height: usize, rgb: &[u8]) -> Result<()> {
    debug_assert_eq!(rgb.len(), width * height * 3);
    write!(out, "P6\n{width}\n{height}\n255\n")?;
    out.write_all(rgb)?;
    Ok(())
}

/// Grabs one frame of the scanout buffer and dumps it to `out`.
pub fn take(out: &mut impl Write, geometry: Option<&GeometrySpec>) -> Result<()> {
    let source = ScanoutSource::acquire()?;
    let rect = GeometrySpec::resolve(geometry, source.fb.width, source.fb.height)?;
    let layout = PixelLayout::detect(source.fb.fourcc, source.fb.modifier);

    let mut rgb = vec![0u8; rect.w * rect.h * 3];
    detile::detile_rows(
        &mut rgb,
        source.fb.map.bytes(),
        layout,
        source.fb.pitch as usize,
        rect,
        0,
        rect.h,
    );

    write_ppm(out, rect.w, rect.h, &rgb).context("couldn't write screenshot")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::detile::{detile_rows, CaptureRect};

    /// Minimal P6 reader for the round-trip checks.
    fn decode_ppm(data: &[u8]) -> (usize, usize, Vec<u8>) {
        let mut fields = Vec::new();
        let mut at = 0;
        while fields.len() < 4 {
            let end = data[at..].iter().position(|&b| b == b'\n').unwrap() + at;
            fields.push(std::str::from_utf8(&data[at..end]).unwrap().to_owned());
            at = end + 1;
        }
        assert_eq!(fields[0], "P6");
        assert_eq!(fields[3], "255");
        let w: usize = fields[1].parse().unwrap();
        let h: usize = fields[2].parse().unwrap();
        let body = data[at..].to_vec();
        assert_eq!(body.len(), w * h * 3);
        (w, h, body)
    }

    #[test]
    fn ppm_round_trip() {
        let (w, h) = (5usize, 3usize);
        let rgb: Vec<u8> = (0..w * h * 3).map(|n| n as u8).collect();

        let mut encoded = Vec::new();
        write_ppm(&mut encoded, w, h, &rgb).unwrap();

        let (dw, dh, body) = decode_ppm(&encoded);
        assert_eq!((dw, dh), (w, h));
        assert_eq!(body, rgb);
    }

    #[test]
    fn linear_full_frame_screenshot_bytes() {
        // 4x2 XR24 frame, pitch 16: the PPM body is the byte-swapped samples.
        let input: Vec<u8> = [
            0x10u8, 0x20, 0x30, 0x00, 0x11, 0x21, 0x31, 0x00, //
            0x12, 0x22, 0x32, 0x00, 0x13, 0x23, 0x33, 0x00, //
            0x14, 0x24, 0x34, 0x00, 0x15, 0x25, 0x35, 0x00, //
            0x16, 0x26, 0x36, 0x00, 0x17, 0x27, 0x37, 0x00,
        ]
        .to_vec();

        let rect = CaptureRect {
            x: 0,
            y: 0,
            w: 4,
            h: 2,
        };
        let mut rgb = vec![0u8; 4 * 2 * 3];
        detile_rows(&mut rgb, &input, PixelLayout::Linear, 16, rect, 0, 2);

        let mut encoded = Vec::new();
        write_ppm(&mut encoded, 4, 2, &rgb).unwrap();

        let expected_header = b"P6\n4\n2\n255\n";
        assert_eq!(&encoded[..expected_header.len()], expected_header);
        assert_eq!(
            &encoded[expected_header.len()..],
            &[
                0x30, 0x20, 0x10, 0x31, 0x21, 0x11, 0x32, 0x22, 0x12, 0x33, 0x23, 0x13, //
                0x34, 0x24, 0x14, 0x35, 0x25, 0x15, 0x36, 0x26, 0x16, 0x37, 0x27, 0x17,
            ]
        );
    }
}
