//! The detile worker pool.
//!
//! One worker per logical CPU, each owning a horizontal strip of the output
//! image. Every frame the driver releases one start token per worker and
//! then collects exactly one finish token per worker; the channels buffer
//! tokens, so workers finishing out of order can never deadlock the
//! rendezvous. Receiving all finish tokens also orders every strip write
//! before the driver's next read of the output image.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender};

use crate::detile::{self, CaptureRect, PixelLayout};

/// Raw pointer wrappers so worker threads can share the mapped input and the
/// strip-partitioned output image.
#[derive(Clone, Copy)]
struct SendPtr(*const u8);
unsafe impl Send for SendPtr {}

#[derive(Clone, Copy)]
struct SendPtrMut(*mut u8);
unsafe impl Send for SendPtrMut {}

/// Everything a worker needs to convert its strip of one frame.
#[derive(Clone, Copy)]
pub struct DetileJob {
    /// Mapped framebuffer bytes.
    pub input: *const u8,
    pub input_len: usize,
    /// Packed RGB output image, `rect.w * rect.h * 3` bytes.
    pub output: *mut u8,
    pub layout: PixelLayout,
    pub pitch: usize,
    pub rect: CaptureRect,
}

/// Row partitioning of the output image across `workers` strips.
#[derive(Clone, Copy)]
pub struct StripPlan {
    workers: usize,
    strip_h: usize,
    height: usize,
}

impl StripPlan {
    pub fn new(workers: usize, height: usize) -> Self {
        assert!(workers > 0 && height > 0);
        Self {
            workers,
            strip_h: height.div_ceil(workers),
            height,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Output row range `[start, end)` owned by worker `i`; empty when more
    /// workers than rows exist.
    pub fn rows(&self, i: usize) -> (usize, usize) {
        let start = (i * self.strip_h).min(self.height);
        let end = ((i + 1) * self.strip_h).min(self.height);
        (start, end)
    }
}

struct WorkerLink {
    start_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// The pool plus the per-frame rendezvous the driver drives.
pub struct DetilePool {
    links: Vec<WorkerLink>,
    done_rx: Receiver<()>,
    stop: Arc<AtomicBool>,
}

impl DetilePool {
    /// Spawns the pool.
    ///
    /// # Safety
    ///
    /// `job.input` and `job.output` must stay valid until [`Self::shutdown`]
    /// returns (or the pool is dropped after its last [`Self::collect`]).
    /// The output region must not be read or written by anyone else between
    /// a [`Self::kick`] and the matching [`Self::collect`].
    pub unsafe fn spawn(plan: StripPlan, job: DetileJob) -> Self {
        let (done_tx, done_rx) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let links = (0..plan.workers())
            .map(|i| {
                let (start_tx, start_rx) = channel::unbounded::<()>();
                let done_tx = done_tx.clone();
                let stop = stop.clone();
                let (row0, row1) = plan.rows(i);
                let input = SendPtr(job.input);
                let output = SendPtrMut(job.output);
                let (input_len, layout, pitch, rect) =
                    (job.input_len, job.layout, job.pitch, job.rect);

                let handle = std::thread::spawn(move || {
                    // Rebind the wrappers whole: capturing just the `.0`
                    // fields would capture bare pointers, which are not Send.
                    let input = input;
                    let output = output;
                    while start_rx.recv().is_ok() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        if row0 < row1 {
                            // Strips are disjoint, so the mutable slice
                            // aliases nothing another worker touches.
                            let (input, out_rows) = unsafe {
                                (
                                    slice::from_raw_parts(input.0, input_len),
                                    slice::from_raw_parts_mut(
                                        output.0.add(row0 * rect.w * 3),
                                        (row1 - row0) * rect.w * 3,
                                    ),
                                )
                            };
                            detile::detile_rows(out_rows, input, layout, pitch, rect, row0, row1);
                        }
                        if done_tx.send(()).is_err() {
                            break;
                        }
                    }
                });

                WorkerLink { start_tx, handle }
            })
            .collect();

        Self {
            links,
            done_rx,
            stop,
        }
    }

    /// Releases one start token per worker.
    pub fn kick(&self) -> Result<()> {
        for link in &self.links {
            link.start_tx
                .send(())
                .ok()
                .context("detile worker exited unexpectedly")?;
        }
        Ok(())
    }

    /// Collects one finish token per worker; the frame is ready afterwards.
    pub fn collect(&self) -> Result<()> {
        for _ in &self.links {
            self.done_rx
                .recv()
                .ok()
                .context("detile worker exited unexpectedly")?;
        }
        Ok(())
    }

    /// Cooperative shutdown: workers observe the stop flag on their next
    /// start token and exit; never cancels a worker mid-strip.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        for link in &self.links {
            let _ = link.start_tx.send(());
        }
        for link in self.links {
            let _ = link.handle.join();
        }
    }
}
