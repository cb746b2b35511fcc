//! The recording loop: vblank pacing, the worker rendezvous, encoding, and
//! cluster-oriented muxing with keyframe cues.

use std::fs::OpenOptions;
use std::io::{self, Seek, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;

use anyhow::{bail, Context, Result};
use x264::NalKind;

use crate::cli::GeometrySpec;
use crate::detile::PixelLayout;
use crate::drm::{ScanoutSource, VblankClock};
use crate::encode::VideoEncoder;
use crate::mux::cues::{Cue, CueIndex};
use crate::mux::{Muxer, TrackParams};
use crate::workers::{DetileJob, DetilePool, StripPlan};

/// Ticks (nanoseconds) a block timestamp may reach before the cluster rolls.
const CLUSTER_TICK_LIMIT: u64 = 0x7fff;

/// Largest payload that still fits a 28-bit block size field.
const MAX_BLOCK_PAYLOAD: usize = 0x0fff_ffff - 4;

/// Per-session mux state: the open cluster's frame counter, the rollover
/// policy, and the cue index that grows on every IDR.
///
/// Split out from the capture loop so the container logic can be exercised
/// against an in-memory writer.
pub struct MuxSession<W: Write + Seek> {
    muxer: Muxer<W>,
    index: CueIndex,
    frame_duration_ns: u64,
    frames_in_cluster: u64,
}

impl<W: Write + Seek> MuxSession<W> {
    /// Writes the scaffold and opens the initial cluster at timestamp 0.
    pub fn new(out: W, track: &TrackParams) -> crate::mux::Result<Self> {
        let mut muxer = Muxer::new(out, track)?;
        muxer.open_cluster(0)?;

        Ok(Self {
            muxer,
            index: CueIndex::new(),
            frame_duration_ns: track.default_duration_ns as u64,
            frames_in_cluster: 0,
        })
    }

    /// Moves presentation time forward by `delta` captured-or-skipped
    /// vblanks, so timestamps track the display, not the capture rate.
    pub fn advance(&mut self, delta: u64) {
        self.frames_in_cluster += delta;
    }

    /// PTS of the frame about to be encoded, in vblank ticks.
    pub fn frame_pts(&self) -> i64 {
        self.frames_in_cluster as i64
    }

    /// Emits one NAL as a SimpleBlock, rolling the cluster first when the
    /// block timestamp would overflow its 16-bit field or the NAL is a
    /// keyframe. Oversized NALs are dropped with a warning and leave all
    /// cluster and cue state untouched.
    pub fn push_nal(&mut self, is_idr: bool, payload: &[u8]) -> crate::mux::Result<()> {
        if payload.len() > MAX_BLOCK_PAYLOAD {
            tracing::warn!(
                size = payload.len(),
                "skipping frame: encoded size does not fit a block"
            );
            return Ok(());
        }

        let ts_in_cluster = self.frames_in_cluster * self.frame_duration_ns;
        if ts_in_cluster > CLUSTER_TICK_LIMIT || is_idr {
            self.muxer
                .roll_cluster(self.muxer.cluster_timestamp() + ts_in_cluster)?;
            self.frames_in_cluster = 0;
        }

        let ts_in_cluster = self.frames_in_cluster * self.frame_duration_ns;
        if is_idr {
            self.index.push(Cue {
                timestamp: self.muxer.cluster_timestamp() + ts_in_cluster,
                cluster_position: self.muxer.cluster_position(),
                relative_position: self.muxer.block_offset(),
            });
        }

        self.muxer.write_block(ts_in_cluster as u16, payload)
    }

    /// Finalizes the container and returns the output.
    pub fn finish(self) -> crate::mux::Result<W> {
        self.muxer.finish(&self.index)
    }
}

/// Zero-timeout readability poll on standard input; a readable byte is the
/// stop signal.
fn stdin_readable() -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd: libc::STDIN_FILENO,
        events: libc::POLLIN,
        revents: 0,
    };

    if unsafe { libc::poll(&mut pfd, 1, 0) } < 0 {
        bail!(
            "couldn't poll standard input: {}",
            io::Error::last_os_error()
        );
    }
    Ok(pfd.revents & libc::POLLIN != 0)
}

/// Records until standard input becomes readable.
pub fn record(
    output: &Path,
    preset: &str,
    geometry: Option<&GeometrySpec>,
    interval: u32,
) -> Result<()> {
    let source = ScanoutSource::acquire()?;
    let rect = GeometrySpec::resolve(geometry, source.fb.width, source.fb.height)?;
    let layout = PixelLayout::detect(source.fb.fourcc, source.fb.modifier);

    let refresh_hz = source.refresh_hz.unwrap_or_else(|| {
        tracing::warn!("couldn't determine native refresh rate, assuming 60 Hz");
        60
    });
    let frame_duration_ns = (1_000_000_000.0 / refresh_hz as f64).round() as u64;

    let mut encoder = VideoEncoder::new(preset, rect.w as u32, rect.h as u32)
        .context("couldn't configure encoder")?;
    let headers = encoder.headers()?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(output)
        .with_context(|| format!("couldn't open {}", output.display()))?;

    let mut session = MuxSession::new(
        file,
        &TrackParams {
            width: rect.w as u16,
            height: rect.h as u16,
            default_duration_ns: (frame_duration_ns * interval as u64) as u32,
            sps: &headers.sps,
            pps: &headers.pps,
            app_name: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")),
        },
    )?;

    let mut rgb = vec![0u8; rect.w * rect.h * 3];

    let workers = thread::available_parallelism().map_or(1, |n| n.get());
    let plan = StripPlan::new(workers, rect.h);
    let job = DetileJob {
        input: source.fb.map.bytes().as_ptr(),
        input_len: source.fb.map.len(),
        output: rgb.as_mut_ptr(),
        layout,
        pitch: source.fb.pitch as usize,
        rect,
    };
    // The mapping and the RGB image both outlive the pool: it is shut down
    // before this function returns.
    let pool = unsafe { DetilePool::spawn(plan, job) };

    tracing::info!(workers, ?layout, "recording; press ENTER to stop");

    let mut clock = VblankClock::new(&source.card, interval);
    let mut last_vblank: Option<u32> = None;
    let result = (|| -> Result<()> {
        loop {
            let seq = clock.wait()?;
            if let Some(last) = last_vblank {
                let delta = seq.wrapping_sub(last);
                if delta > interval {
                    tracing::warn!(missed = delta - interval, "at least one frame was skipped");
                }
                session.advance(delta as u64);
            }
            last_vblank = Some(seq);

            pool.kick()?;
            pool.collect()?;

            for nal in encoder.encode(&rgb, session.frame_pts())? {
                session.push_nal(nal.kind == NalKind::Idr, &nal.payload)?;
            }

            if stdin_readable()? {
                return Ok(());
            }
        }
    })();
    pool.shutdown();
    result?;

    tracing::info!("finishing and adding cues");
    session.finish().context("couldn't finalize output file")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mux::SEGMENT_BODY_START;
    use std::io::Cursor;

    const FRAME_NS: u64 = 16_666_667;

    fn new_session(frame_duration_ns: u64) -> MuxSession<Cursor<Vec<u8>>> {
        MuxSession::new(
            Cursor::new(Vec::new()),
            &TrackParams {
                width: 64,
                height: 48,
                default_duration_ns: frame_duration_ns as u32,
                sps: &[0x67, 0x01, 0x02],
                pps: &[0x68, 0x03],
                app_name: "sessiontest",
            },
        )
        .unwrap()
    }

    fn be32(buf: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn be64(buf: &[u8], at: usize) -> u64 {
        u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
    }

    /// Walks the segment body, returning (offset, timestamp, block_count)
    /// per cluster and the offset of the Cues element.
    fn walk_clusters(buf: &[u8]) -> (Vec<(usize, u64, usize)>, usize) {
        let body = SEGMENT_BODY_START as usize;
        let mut at = body;
        // Skip SeekHead, Tracks, Info.
        for _ in 0..3 {
            let size = (buf[at + 4] & 0x7f) as usize;
            at += 5 + size;
        }

        let mut clusters = Vec::new();
        while buf[at..at + 4] == [0x1f, 0x43, 0xb6, 0x75] {
            let size = (be32(buf, at + 4) & 0x0fff_ffff) as usize;
            assert_eq!(&buf[at + 8..at + 10], &[0xe7, 0x88]);
            let timestamp = be64(buf, at + 10);

            let mut blocks = 0;
            let mut block_at = at + 18;
            let end = at + 8 + size;
            while block_at < end {
                assert_eq!(buf[block_at], 0xa3);
                let block_size = (be32(buf, block_at + 1) & 0x0fff_ffff) as usize;
                blocks += 1;
                block_at += 5 + block_size;
            }
            assert_eq!(block_at, end);

            clusters.push((at - body, timestamp, blocks));
            at = end;
        }

        assert_eq!(&buf[at..at + 4], &[0x1c, 0x53, 0xbb, 0x6b]);
        (clusters, at - body)
    }

    #[test]
    fn timestamp_rollover_at_60hz() {
        // At timestamp scale 1 ns a 60 Hz frame lasts 16_666_667 ticks,
        // far past the 0x7fff limit, so every frame after a cluster's first
        // one opens a new cluster.
        let mut session = new_session(FRAME_NS);
        for frame in 0..4u64 {
            if frame > 0 {
                session.advance(1);
            }
            session.push_nal(false, &[0x41; 16]).unwrap();
        }
        let buf = session.finish().unwrap().into_inner();

        let (clusters, _) = walk_clusters(&buf);
        // Frame 0 lands in the initial cluster; frames 1..4 each rolled.
        assert_eq!(clusters.len(), 4);
        assert_eq!(clusters[0].2, 1);
        for (i, &(_, timestamp, blocks)) in clusters.iter().enumerate() {
            assert_eq!(timestamp, i as u64 * FRAME_NS);
            assert_eq!(blocks, 1);
        }
    }

    #[test]
    fn no_rollover_below_tick_limit() {
        // With a tiny frame duration everything fits one cluster.
        let mut session = new_session(1000);
        for frame in 0..30u64 {
            if frame > 0 {
                session.advance(1);
            }
            session.push_nal(false, &[0x41; 8]).unwrap();
        }
        let buf = session.finish().unwrap().into_inner();

        let (clusters, _) = walk_clusters(&buf);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].2, 30);

        // The boundary frame: ticks exceed 0x7fff at frame 33.
        let mut session = new_session(1000);
        for frame in 0..40u64 {
            if frame > 0 {
                session.advance(1);
            }
            session.push_nal(false, &[0x41; 8]).unwrap();
        }
        let buf = session.finish().unwrap().into_inner();
        let (clusters, _) = walk_clusters(&buf);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].2, 33); // frames 0..=32, ts 0..=32000
        assert_eq!(clusters[1].1, 33_000);
    }

    #[test]
    fn idr_rolls_cluster_and_records_cue() {
        let mut session = new_session(1000);
        for frame in 0..20u64 {
            if frame > 0 {
                session.advance(1);
            }
            session.push_nal(frame == 10, &[0x41; 8]).unwrap();
        }
        let buf = session.finish().unwrap().into_inner();

        let (clusters, cues_at) = walk_clusters(&buf);
        // The IDR on frame 10 split the stream; the initial cluster kept
        // frames 0..10.
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].2, 10);
        assert_eq!(clusters[1].0, clusters[0].0 + 8 + (10 + 10 * (8 + 9)));
        assert_eq!(clusters[1].1, 10_000);

        // One cue, pointing at the new cluster's first block.
        let body = SEGMENT_BODY_START as usize;
        let cues_size = (be32(&buf, body + cues_at + 4) & 0x0fff_ffff) as usize;
        assert_eq!(cues_size, 29);
        let point = body + cues_at + 8;
        assert_eq!(be64(&buf, point + 4), 10_000); // CueTime
        assert_eq!(be32(&buf, point + 19), clusters[1].0 as u32);
        assert_eq!(be32(&buf, point + 25), 10); // fresh-cluster block offset
    }

    #[test]
    fn finalization_after_long_run() {
        let mut session = new_session(1000);
        for frame in 0..200u64 {
            if frame > 0 {
                session.advance(1);
            }
            let is_idr = frame % 70 == 0; // frames 0, 70, 140
            session.push_nal(is_idr, &[0x41; 8]).unwrap();
        }
        let buf = session.finish().unwrap().into_inner();

        let body = SEGMENT_BODY_START as usize;
        let (_, cues_at) = walk_clusters(&buf);

        // Three CuePoints.
        let cues_size = (be32(&buf, body + cues_at + 4) & 0x0fff_ffff) as usize;
        assert_eq!(cues_size, 3 * 29);
        assert_eq!(buf.len(), body + cues_at + 8 + cues_size);

        // SeekHead's Cues position was patched to the Cues offset.
        assert_eq!(be32(&buf, body + 46) as usize, cues_at);

        // Segment size covers the whole body.
        assert_eq!(be32(&buf, 44), 0x1000_0000 | (buf.len() - body) as u32);
    }

    #[test]
    fn block_timestamps_are_monotone() {
        let mut session = new_session(FRAME_NS);
        let mut pushed = 0u64;
        for frame in 0..50u64 {
            if frame > 0 {
                session.advance(1);
            }
            session.push_nal(frame % 9 == 0, &[0x41; 4]).unwrap();
            pushed += 1;
        }
        let buf = session.finish().unwrap().into_inner();

        let (clusters, _) = walk_clusters(&buf);
        assert_eq!(clusters.iter().map(|c| c.2 as u64).sum::<u64>(), pushed);

        let mut last = 0u64;
        for &(_, timestamp, _) in &clusters {
            assert!(timestamp >= last);
            last = timestamp;
        }
    }

    #[test]
    fn oversized_nal_is_dropped_without_state_change() {
        let mut session = new_session(1000);
        session.push_nal(false, &[0x41; 8]).unwrap();

        // A payload over the 28-bit limit is skipped entirely.
        let huge = vec![0u8; MAX_BLOCK_PAYLOAD + 1];
        session.advance(1);
        session.push_nal(true, &huge).unwrap();

        session.push_nal(false, &[0x41; 8]).unwrap();
        let buf = session.finish().unwrap().into_inner();

        let (clusters, cues_at) = walk_clusters(&buf);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].2, 2);

        // No cue was recorded for the dropped IDR.
        let body = SEGMENT_BODY_START as usize;
        assert_eq!(be32(&buf, body + cues_at + 4) & 0x0fff_ffff, 0);
    }
}
