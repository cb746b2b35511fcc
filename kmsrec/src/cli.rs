//! Command line surface: flags, the capture-geometry grammar, and the
//! last-one-wins mode selection.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, Parser};

use crate::detile::CaptureRect;

#[derive(Parser, Debug)]
#[command(
    name = "kmsrec",
    version,
    about = "Records the scanout framebuffer of the primary display"
)]
pub struct Cli {
    /// Dump info about the DRM setup and exit
    #[arg(short = 'd', long)]
    pub dump_info: bool,

    /// Take a screenshot and print it to stdout as binary PPM
    #[arg(short = 's', long)]
    pub take_screenshot: bool,

    /// Record the screen to the --output file until ENTER is pressed
    #[arg(short = 'r', long)]
    pub record_screen: bool,

    /// Encoder preset used when recording
    #[arg(short, long, default_value = "medium")]
    pub preset: String,

    /// Portion of the screen to capture: X,Y[,WxH], e.g. 10,20,40x40
    #[arg(short, long, value_parser = GeometrySpec::parse)]
    pub geometry: Option<GeometrySpec>,

    /// Capture one frame every N vblanks
    #[arg(
        short = 'y',
        long,
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=9)
    )]
    pub record_every_th: u32,

    /// Output file, required for recording
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DumpInfo,
    Screenshot,
    Record,
}

/// Picks the mode flag appearing last on the command line; with none given,
/// the tool dumps info.
pub fn mode(matches: &ArgMatches) -> Mode {
    let mut mode = Mode::DumpInfo;
    let mut last = 0;

    for (id, candidate) in [
        ("dump_info", Mode::DumpInfo),
        ("take_screenshot", Mode::Screenshot),
        ("record_screen", Mode::Record),
    ] {
        if matches.value_source(id) != Some(ValueSource::CommandLine) {
            continue;
        }
        if let Some(index) = matches.index_of(id) {
            if index >= last {
                last = index;
                mode = candidate;
            }
        }
    }

    mode
}

/// A parsed `-g` argument. Unset width or height extend the capture to the
/// right or bottom edge of the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometrySpec {
    pub x: u32,
    pub y: u32,
    pub w: Option<u32>,
    pub h: Option<u32>,
}

impl GeometrySpec {
    /// Parses `X[,Y[,W[xH]]]`: digits build decimal integers, a comma moves
    /// to the next of X, Y, W, and `x`/`X` separates W from H.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut values: [Option<u32>; 4] = [None; 4];
        let mut field = 0usize;

        for c in s.chars() {
            match c {
                '0'..='9' => {
                    let digit = c as u32 - '0' as u32;
                    let value = values[field]
                        .unwrap_or(0)
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or_else(|| format!("geometry value too large in {s:?}"))?;
                    values[field] = Some(value);
                }
                ',' => {
                    if values[field].is_none() || field >= 2 {
                        return Err(format!("wrong syntax for geometry {s:?}"));
                    }
                    field += 1;
                }
                'x' | 'X' => {
                    if field != 2 || values[2].is_none() {
                        return Err(format!("wrong syntax for geometry {s:?}"));
                    }
                    field = 3;
                }
                _ => return Err(format!("unexpected character {c:?} in geometry {s:?}")),
            }
        }

        if values[field].is_none() {
            return Err(format!("wrong syntax for geometry {s:?}"));
        }

        Ok(Self {
            x: values[0].expect("first field always parsed"),
            y: values[1].unwrap_or(0),
            w: values[2],
            h: values[3],
        })
    }

    /// Validates a geometry (or the full screen, when absent) against the
    /// framebuffer dimensions.
    pub fn resolve(spec: Option<&Self>, fb_width: u32, fb_height: u32) -> Result<CaptureRect> {
        let full = Self {
            x: 0,
            y: 0,
            w: None,
            h: None,
        };
        let spec = spec.unwrap_or(&full);

        let w = spec.w.unwrap_or(fb_width.saturating_sub(spec.x));
        let h = spec.h.unwrap_or(fb_height.saturating_sub(spec.y));

        if w == 0
            || h == 0
            || spec.x as u64 + w as u64 > fb_width as u64
            || spec.y as u64 + h as u64 > fb_height as u64
        {
            bail!("out-of-bound geometry in -g option");
        }

        Ok(CaptureRect {
            x: spec.x as usize,
            y: spec.y as usize,
            w: w as usize,
            h: h as usize,
        })
    }
}
