//! Direct Rendering Manager access: card enumeration, CRTC and framebuffer
//! inspection, dma-buf export of the scanout buffer, and the vblank clock.
//!
//! Everything goes through raw ioctls on the card node; the structures below
//! mirror the kernel UAPI layouts field for field.

use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no DRM device found under /dev/dri")]
    NoDevice,
    #[error("could not open {path:?}: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },
    #[error("{0} ioctl failed: {1}")]
    Ioctl(&'static str, io::Error),
    #[error("card reports no CRTC")]
    NoCrtc,
    #[error("CRTC {0} has no framebuffer bound")]
    NoFramebuffer(u32),
    #[error("could not stat the framebuffer dma-buf: {0}")]
    Stat(io::Error),
    #[error("could not map the framebuffer dma-buf: {0}")]
    Map(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const DRM_IOCTL_BASE: c_ulong = b'd' as c_ulong;

const fn drm_iowr(nr: c_ulong, size: usize) -> c_ulong {
    (3 << 30) | ((size as c_ulong) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const DRM_IOCTL_WAIT_VBLANK: c_ulong = drm_iowr(0x3a, mem::size_of::<DrmWaitVblank>());
const DRM_IOCTL_PRIME_HANDLE_TO_FD: c_ulong = drm_iowr(0x2d, mem::size_of::<DrmPrimeHandle>());
const DRM_IOCTL_MODE_GETRESOURCES: c_ulong = drm_iowr(0xa0, mem::size_of::<DrmModeCardRes>());
const DRM_IOCTL_MODE_GETCRTC: c_ulong = drm_iowr(0xa1, mem::size_of::<DrmModeCrtc>());
const DRM_IOCTL_MODE_GETFB: c_ulong = drm_iowr(0xad, mem::size_of::<DrmModeFbCmd>());
const DRM_IOCTL_MODE_GETFB2: c_ulong = drm_iowr(0xce, mem::size_of::<DrmModeFbCmd2>());
const DRM_IOCTL_MODE_GETPLANERESOURCES: c_ulong =
    drm_iowr(0xb5, mem::size_of::<DrmModeGetPlaneRes>());
const DRM_IOCTL_MODE_GETPLANE: c_ulong = drm_iowr(0xb6, mem::size_of::<DrmModeGetPlane>());

const DRM_VBLANK_ABSOLUTE: u32 = 0x0;
const DRM_VBLANK_RELATIVE: u32 = 0x1;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeCardRes {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeInfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    type_: u32,
    name: [u8; 32],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeCrtc {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: DrmModeInfo,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeFbCmd {
    fb_id: u32,
    width: u32,
    height: u32,
    pitch: u32,
    bpp: u32,
    depth: u32,
    handle: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeFbCmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    modifier: [u64; 4],
}

#[repr(C)]
#[derive(Default)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

/// Stands in for both halves of the kernel's wait-vblank union: the request
/// reads the first two words, the reply fills all four.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmWaitVblank {
    request_type: u32,
    sequence: u32,
    tval_sec: i64,
    tval_usec: i64,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeGetPlaneRes {
    plane_id_ptr: u64,
    count_planes: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // kernel ABI mirror
struct DrmModeGetPlane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    possible_crtcs: u32,
    gamma_size: u32,
    count_format_types: u32,
    format_type_ptr: u64,
}

/// An open DRM card node.
pub struct Card {
    fd: c_int,
    path: PathBuf,
}

/// Resource id lists reported by a card.
pub struct Resources {
    pub fbs: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
}

/// One CRTC's current state.
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mode_valid: bool,
    pub vrefresh: u32,
    pub mode_name: String,
}

/// Legacy framebuffer description (GETFB).
pub struct FbInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub handle: u32,
}

/// Modifier-aware framebuffer description (GETFB2).
pub struct FbInfo2 {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: u64,
}

/// One plane's current state.
pub struct PlaneInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
}

impl Card {
    pub fn open(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            Error::DeviceOpen {
                path: path.to_owned(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            }
        })?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(Error::DeviceOpen {
                path: path.to_owned(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            fd,
            path: path.to_owned(),
        })
    }

    /// Opens the first card found under `/dev/dri`.
    pub fn open_first() -> Result<Self> {
        let first = Self::scan().into_iter().next().ok_or(Error::NoDevice)?;
        Self::open(&first)
    }

    /// Lists the primary card nodes, lowest number first.
    pub fn scan() -> Vec<PathBuf> {
        let mut cards = Vec::new();
        if let Ok(entries) = fs::read_dir("/dev/dri") {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with("card") {
                    cards.push(entry.path());
                }
            }
        }
        cards.sort();
        cards
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, name: &'static str, request: c_ulong, arg: &mut T) -> Result<()> {
        if unsafe { libc::ioctl(self.fd, request, arg as *mut T) } != 0 {
            return Err(Error::Ioctl(name, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Fetches the card's resource id lists (two-call protocol).
    pub fn resources(&self) -> Result<Resources> {
        let mut res = DrmModeCardRes::default();
        self.ioctl("MODE_GETRESOURCES", DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

        let mut fbs = vec![0u32; res.count_fbs as usize];
        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut encoders = vec![0u32; res.count_encoders as usize];

        res.fb_id_ptr = fbs.as_mut_ptr() as u64;
        res.crtc_id_ptr = crtcs.as_mut_ptr() as u64;
        res.connector_id_ptr = connectors.as_mut_ptr() as u64;
        res.encoder_id_ptr = encoders.as_mut_ptr() as u64;

        self.ioctl("MODE_GETRESOURCES", DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

        fbs.truncate(res.count_fbs as usize);
        crtcs.truncate(res.count_crtcs as usize);
        connectors.truncate(res.count_connectors as usize);
        encoders.truncate(res.count_encoders as usize);

        Ok(Resources {
            fbs,
            crtcs,
            connectors,
            encoders,
        })
    }

    pub fn crtc(&self, id: u32) -> Result<CrtcInfo> {
        let mut crtc = DrmModeCrtc {
            crtc_id: id,
            ..Default::default()
        };
        self.ioctl("MODE_GETCRTC", DRM_IOCTL_MODE_GETCRTC, &mut crtc)?;

        let mode_name = crtc
            .mode
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as char)
            .collect();

        Ok(CrtcInfo {
            id,
            fb_id: crtc.fb_id,
            x: crtc.x,
            y: crtc.y,
            width: crtc.mode.hdisplay as u32,
            height: crtc.mode.vdisplay as u32,
            mode_valid: crtc.mode_valid != 0,
            vrefresh: crtc.mode.vrefresh,
            mode_name,
        })
    }

    pub fn fb(&self, fb_id: u32) -> Result<FbInfo> {
        let mut fb = DrmModeFbCmd {
            fb_id,
            ..Default::default()
        };
        self.ioctl("MODE_GETFB", DRM_IOCTL_MODE_GETFB, &mut fb)?;

        Ok(FbInfo {
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.bpp,
            depth: fb.depth,
            handle: fb.handle,
        })
    }

    pub fn fb2(&self, fb_id: u32) -> Result<FbInfo2> {
        let mut fb = DrmModeFbCmd2 {
            fb_id,
            ..Default::default()
        };
        self.ioctl("MODE_GETFB2", DRM_IOCTL_MODE_GETFB2, &mut fb)?;

        Ok(FbInfo2 {
            width: fb.width,
            height: fb.height,
            pixel_format: fb.pixel_format,
            handles: fb.handles,
            pitches: fb.pitches,
            offsets: fb.offsets,
            modifier: fb.modifier[0],
        })
    }

    pub fn planes(&self) -> Result<Vec<u32>> {
        let mut res = DrmModeGetPlaneRes::default();
        self.ioctl(
            "MODE_GETPLANERESOURCES",
            DRM_IOCTL_MODE_GETPLANERESOURCES,
            &mut res,
        )?;

        let mut planes = vec![0u32; res.count_planes as usize];
        res.plane_id_ptr = planes.as_mut_ptr() as u64;
        self.ioctl(
            "MODE_GETPLANERESOURCES",
            DRM_IOCTL_MODE_GETPLANERESOURCES,
            &mut res,
        )?;

        planes.truncate(res.count_planes as usize);
        Ok(planes)
    }

    pub fn plane(&self, id: u32) -> Result<PlaneInfo> {
        let mut plane = DrmModeGetPlane {
            plane_id: id,
            ..Default::default()
        };
        self.ioctl("MODE_GETPLANE", DRM_IOCTL_MODE_GETPLANE, &mut plane)?;

        Ok(PlaneInfo {
            id,
            crtc_id: plane.crtc_id,
            fb_id: plane.fb_id,
            possible_crtcs: plane.possible_crtcs,
            gamma_size: plane.gamma_size,
        })
    }

    /// Exports a GEM handle as a dma-buf file descriptor.
    pub fn export_dmabuf(&self, handle: u32) -> Result<c_int> {
        let mut prime = DrmPrimeHandle {
            handle,
            flags: libc::O_RDONLY as u32,
            fd: -1,
        };
        self.ioctl(
            "PRIME_HANDLE_TO_FD",
            DRM_IOCTL_PRIME_HANDLE_TO_FD,
            &mut prime,
        )?;
        Ok(prime.fd)
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A read-only shared mapping of an exported dma-buf.
pub struct DmabufMap {
    ptr: *mut c_void,
    len: usize,
    fd: c_int,
}

// The mapping is PROT_READ and never written by this process.
unsafe impl Send for DmabufMap {}
unsafe impl Sync for DmabufMap {}

impl DmabufMap {
    /// Takes ownership of `fd`, mapping `len` bytes at `offset`.
    fn new(fd: c_int, len: usize, offset: u32) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Map(err));
        }

        Ok(Self { ptr, len, fd })
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DmabufMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
            libc::close(self.fd);
        }
    }
}

/// Size of the buffer behind a dma-buf fd.
pub fn dmabuf_size(fd: c_int) -> Result<usize> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(Error::Stat(io::Error::last_os_error()));
    }
    Ok(stat.st_size as usize)
}

/// The scanout framebuffer of the first CRTC, mapped read-only.
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub fourcc: u32,
    pub modifier: u64,
    pub map: DmabufMap,
}

/// Everything capture needs: the card (for vblank waits), the mapped
/// framebuffer, and the display's refresh rate if the mode is valid.
pub struct ScanoutSource {
    pub card: Card,
    pub fb: Framebuffer,
    pub refresh_hz: Option<u32>,
}

impl ScanoutSource {
    /// First card, first CRTC, currently bound framebuffer.
    pub fn acquire() -> Result<Self> {
        let card = Card::open_first()?;
        let res = card.resources()?;
        let crtc_id = *res.crtcs.first().ok_or(Error::NoCrtc)?;
        let crtc = card.crtc(crtc_id)?;

        if crtc.fb_id == 0 {
            return Err(Error::NoFramebuffer(crtc_id));
        }

        let refresh_hz = (crtc.mode_valid && crtc.vrefresh > 0).then_some(crtc.vrefresh);

        let fb2 = card.fb2(crtc.fb_id)?;
        let dmabuf_fd = card.export_dmabuf(fb2.handles[0])?;
        let len = match dmabuf_size(dmabuf_fd) {
            Ok(len) => len,
            Err(e) => {
                unsafe { libc::close(dmabuf_fd) };
                return Err(e);
            }
        };
        let map = DmabufMap::new(dmabuf_fd, len, fb2.offsets[0])?;

        tracing::info!(
            card = %card.path().display(),
            crtc = crtc_id,
            fb = crtc.fb_id,
            width = fb2.width,
            height = fb2.height,
            "capturing first framebuffer of first CRTC"
        );

        Ok(Self {
            card,
            fb: Framebuffer {
                width: fb2.width,
                height: fb2.height,
                pitch: fb2.pitches[0],
                fourcc: fb2.pixel_format,
                modifier: fb2.modifier,
                map,
            },
            refresh_hz,
        })
    }
}

/// Paces capture on the display's vertical blank interrupt.
///
/// The first wait is relative (next vblank); every later wait targets an
/// absolute sequence number `interval` past the previous reply, so a slow
/// frame shows up as a sequence jump rather than a drifting clock.
pub struct VblankClock<'a> {
    card: &'a Card,
    interval: u32,
    next_target: Option<u32>,
}

impl<'a> VblankClock<'a> {
    pub fn new(card: &'a Card, interval: u32) -> Self {
        Self {
            card,
            interval,
            next_target: None,
        }
    }

    /// Blocks until the target vblank and returns its sequence number.
    pub fn wait(&mut self) -> Result<u32> {
        let mut vbl = DrmWaitVblank::default();
        match self.next_target {
            None => {
                vbl.request_type = DRM_VBLANK_RELATIVE;
                vbl.sequence = 1;
            }
            Some(target) => {
                vbl.request_type = DRM_VBLANK_ABSOLUTE;
                vbl.sequence = target;
            }
        }

        self.card
            .ioctl("WAIT_VBLANK", DRM_IOCTL_WAIT_VBLANK, &mut vbl)?;

        self.next_target = Some(vbl.sequence.wrapping_add(self.interval));
        Ok(vbl.sequence)
    }
}
