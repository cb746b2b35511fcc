//! The textual report behind `--dump-info`: every card, its CRTCs and their
//! framebuffers, and the plane list. Per-card trouble is reported inline and
//! the dump moves on; only a missing /dev/dri is fatal.

use std::io::Write;

use anyhow::{bail, Result};

use crate::detile::format_fourcc;
use crate::drm::{self, Card};

pub fn dump_report(out: &mut impl Write) -> Result<()> {
    let cards = Card::scan();
    if cards.is_empty() {
        bail!("no DRM device found under /dev/dri");
    }

    writeln!(
        out,
        "there {} {} device{}",
        if cards.len() == 1 { "is" } else { "are" },
        cards.len(),
        if cards.len() == 1 { "" } else { "s" }
    )?;

    for path in cards {
        writeln!(out, "device {}", path.display())?;

        let card = match Card::open(&path) {
            Ok(card) => card,
            Err(e) => {
                writeln!(out, "\tcould not open: {e}")?;
                continue;
            }
        };

        let res = match card.resources() {
            Ok(res) => res,
            Err(e) => {
                writeln!(out, "\tcould not inspect: {e}")?;
                continue;
            }
        };

        writeln!(
            out,
            "\tframebuffers: {}, crtcs: {}, connectors: {}, encoders: {}",
            res.fbs.len(),
            res.crtcs.len(),
            res.connectors.len(),
            res.encoders.len()
        )?;

        for (n, &crtc_id) in res.crtcs.iter().enumerate() {
            let crtc = match card.crtc(crtc_id) {
                Ok(crtc) => crtc,
                Err(e) => {
                    writeln!(out, "\tcrtc {n}: could not access ({e})")?;
                    continue;
                }
            };

            writeln!(
                out,
                "\tcrtc {n}: id = {}, buffer_id = {}, x = {}, y = {}, w = {}, h = {}",
                crtc.id, crtc.fb_id, crtc.x, crtc.y, crtc.width, crtc.height
            )?;
            if crtc.mode_valid {
                writeln!(
                    out,
                    "\t\tmode {} at {} Hz",
                    crtc.mode_name, crtc.vrefresh
                )?;
            } else {
                writeln!(out, "\t\tmode is not valid")?;
            }

            if crtc.fb_id != 0 {
                dump_framebuffer(out, &card, crtc.fb_id)?;
            }
        }

        match card.planes() {
            Ok(planes) => {
                for (n, &plane_id) in planes.iter().enumerate() {
                    match card.plane(plane_id) {
                        Ok(plane) => writeln!(
                            out,
                            "\tplane {n}: id = {}, crtc_id = {}, fb_id = {}, \
                             possible_crtcs = {:#x}, gamma_size = {}",
                            plane.id,
                            plane.crtc_id,
                            plane.fb_id,
                            plane.possible_crtcs,
                            plane.gamma_size
                        )?,
                        Err(e) => writeln!(out, "\tplane {n}: could not access ({e})")?,
                    }
                }
            }
            Err(e) => writeln!(out, "\tcould not inspect planes: {e}")?,
        }
    }

    Ok(())
}

fn dump_framebuffer(out: &mut impl Write, card: &Card, fb_id: u32) -> Result<()> {
    match card.fb(fb_id) {
        Ok(fb) => writeln!(
            out,
            "\t\tframebuffer {fb_id}: {}x{}, pitch = {}, bpp = {}, depth = {}",
            fb.width, fb.height, fb.pitch, fb.bpp, fb.depth
        )?,
        Err(e) => writeln!(out, "\t\tframebuffer {fb_id}: could not inspect ({e})")?,
    }

    let fb2 = match card.fb2(fb_id) {
        Ok(fb2) => fb2,
        Err(e) => {
            writeln!(out, "\t\tno modifier info ({e})")?;
            return Ok(());
        }
    };

    writeln!(
        out,
        "\t\tpixel_format = {:#010x} ({}), modifier = {:#018x} (vendor = {}, code = {})",
        fb2.pixel_format,
        format_fourcc(fb2.pixel_format),
        fb2.modifier,
        fb2.modifier >> 56,
        fb2.modifier & 0x00ff_ffff_ffff_ffff
    )?;
    writeln!(
        out,
        "\t\thandles = {:?}, pitches = {:?}, offsets = {:?}",
        fb2.handles, fb2.pitches, fb2.offsets
    )?;

    match card.export_dmabuf(fb2.handles[0]) {
        Ok(fd) => {
            match drm::dmabuf_size(fd) {
                Ok(size) => writeln!(out, "\t\tbuffer size is {size}")?,
                Err(e) => writeln!(out, "\t\tcould not stat dma-buf ({e})")?,
            }
            unsafe { libc::close(fd) };
        }
        Err(_) => writeln!(
            out,
            "\t\tcouldn't get a file descriptor for this framebuffer, \
             maybe you lack permissions?"
        )?,
    }

    Ok(())
}
