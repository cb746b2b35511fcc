//! A hand-built Matroska writer.
//!
//! The container is assembled around back-patching: size-bearing elements
//! are written with a placeholder length field and a [`Deferred`] handle
//! remembering its file offset; closing the element consumes the handle and
//! patches the final value. Every length field uses the 4-byte EBML form
//! `0x1000_0000 | n` (length-1 marker, 28-bit value).
//!
//! Layout, in file order: EBML header, Segment(SeekHead, Tracks, Info,
//! Cluster..., Cues). All "position in segment" values are measured from the
//! first byte after the Segment header.

pub mod cues;

use std::io::{Seek, SeekFrom, Write};

use self::cues::CueIndex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("AVC configuration record is {0} bytes, limit is 126")]
    AvcConfigTooLarge(usize),
    #[error("track entry is {0} bytes, limit is 126")]
    TrackEntryTooLarge(usize),
    #[error("track list is {0} bytes, limit is 126")]
    TracksTooLarge(usize),
    #[error("output file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const EBML_HEADER: [u8; 40] = [
    0x1a, 0x45, 0xdf, 0xa3, 0xa3, // EBML, 35-byte body
    0x42, 0x86, 0x81, 0x01, // EBMLVersion 1
    0x42, 0xf7, 0x81, 0x01, // EBMLReadVersion 1
    0x42, 0xf2, 0x81, 0x04, // EBMLMaxIDLength 4
    0x42, 0xf3, 0x81, 0x08, // EBMLMaxSizeLength 8
    0x42, 0x82, 0x88, b'm', b'a', b't', b'r', b'o', b's', b'k', b'a', // DocType
    0x42, 0x87, 0x81, 0x04, // DocTypeVersion 4
    0x42, 0x85, 0x81, 0x02, // DocTypeReadVersion 2
];

/// Absolute offset of the segment body: EBML header plus the 8-byte Segment
/// element header.
pub const SEGMENT_BODY_START: u64 = EBML_HEADER.len() as u64 + 8;

/// Body bytes of a freshly opened cluster (its Timestamp element).
const CLUSTER_HEADER_BODY: u32 = 10;

/// Longest MuxingApp/WritingApp string that keeps the Info element within a
/// one-byte size field.
const MAX_APP_NAME: usize = 56;

/// The absolute offset of an unresolved 4-byte length or position field.
///
/// Not `Clone`: each opened field is resolved exactly once, by value.
struct Deferred(u64);

/// Static properties of the single video track.
pub struct TrackParams<'a> {
    pub width: u16,
    pub height: u16,
    /// Nanoseconds per block (frame duration times the capture interval).
    pub default_duration_ns: u32,
    pub sps: &'a [u8],
    pub pps: &'a [u8],
    /// Written as both MuxingApp and WritingApp.
    pub app_name: &'a str,
}

struct Cluster {
    position_in_segment: u32,
    timestamp: u64,
    size_field: Deferred,
    running_size: u32,
}

/// Writes the container; owns the output exclusively.
pub struct Muxer<W: Write + Seek> {
    out: W,
    segment_size: Option<Deferred>,
    cues_position: Option<Deferred>,
    cluster: Option<Cluster>,
}

impl<W: Write + Seek> Muxer<W> {
    /// Writes the scaffold (everything up to the first cluster).
    pub fn new(mut out: W, track: &TrackParams) -> Result<Self> {
        let (scaffold, segment_size_at, cues_position_at) = build_scaffold(track)?;
        out.write_all(&scaffold)?;

        Ok(Self {
            out,
            segment_size: Some(Deferred(segment_size_at)),
            cues_position: Some(Deferred(cues_position_at)),
            cluster: None,
        })
    }

    /// Opens a cluster at the current offset with an all-ones size sentinel.
    pub fn open_cluster(&mut self, timestamp: u64) -> Result<()> {
        assert!(self.cluster.is_none(), "previous cluster still open");

        let start = self.out.stream_position()?;
        let mut header = [0u8; 18];
        header[0..4].copy_from_slice(&[0x1f, 0x43, 0xb6, 0x75]);
        header[4..8].copy_from_slice(&[0xff; 4]);
        header[8..10].copy_from_slice(&[0xe7, 0x88]);
        header[10..18].copy_from_slice(&timestamp.to_be_bytes());
        self.out.write_all(&header)?;

        self.cluster = Some(Cluster {
            position_in_segment: (start - SEGMENT_BODY_START) as u32,
            timestamp,
            size_field: Deferred(start + 4),
            running_size: CLUSTER_HEADER_BODY,
        });
        Ok(())
    }

    /// Back-patches the open cluster's size field.
    pub fn close_cluster(&mut self) -> Result<()> {
        let cluster = self.cluster.take().expect("no cluster open");
        let size = cluster.running_size;
        self.patch(cluster.size_field, 0x1000_0000 | size)
    }

    /// Closes the current cluster and opens a new one at `timestamp`.
    pub fn roll_cluster(&mut self, timestamp: u64) -> Result<()> {
        self.close_cluster()?;
        self.open_cluster(timestamp)
    }

    /// Base timestamp of the open cluster.
    pub fn cluster_timestamp(&self) -> u64 {
        self.cluster.as_ref().expect("no cluster open").timestamp
    }

    /// Segment-relative offset of the open cluster's first header byte.
    pub fn cluster_position(&self) -> u32 {
        self.cluster
            .as_ref()
            .expect("no cluster open")
            .position_in_segment
    }

    /// Offset inside the cluster body where the next block will land.
    pub fn block_offset(&self) -> u32 {
        self.cluster.as_ref().expect("no cluster open").running_size
    }

    /// Emits one SimpleBlock on track 1.
    pub fn write_block(&mut self, timestamp: u16, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() + 4 <= 0x0fff_ffff);
        let cluster = self.cluster.as_mut().expect("no cluster open");

        let mut header = [0u8; 9];
        header[0] = 0xa3;
        header[1..5].copy_from_slice(&(0x1000_0000 | (payload.len() as u32 + 4)).to_be_bytes());
        header[5] = 0x81;
        header[6..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8] = 0x00;
        self.out.write_all(&header)?;
        self.out.write_all(payload)?;

        cluster.running_size += payload.len() as u32 + 9;
        Ok(())
    }

    /// Closes the last cluster, writes the Cues element, and resolves the
    /// two scaffold-level back-patches (SeekHead Cues position, Segment
    /// size). Returns the output.
    pub fn finish(mut self, index: &CueIndex) -> Result<W> {
        if self.cluster.is_some() {
            self.close_cluster()?;
        }

        let cues_start = self.out.stream_position()?;
        self.out.write_all(&[0x1c, 0x53, 0xbb, 0x6b])?;
        let size_field = Deferred(self.out.stream_position()?);
        self.out.write_all(&[0u8; 4])?;

        for cue in index.iter() {
            let mut entry = [0u8; 29];
            entry[0..2].copy_from_slice(&[0xbb, 0x9b]); // CuePoint
            entry[2..4].copy_from_slice(&[0xb3, 0x88]); // CueTime
            entry[4..12].copy_from_slice(&cue.timestamp.to_be_bytes());
            entry[12..14].copy_from_slice(&[0xb7, 0x8f]); // CueTrackPositions
            entry[14..17].copy_from_slice(&[0xf7, 0x81, 0x01]); // CueTrack 1
            entry[17..19].copy_from_slice(&[0xf1, 0x84]); // CueClusterPosition
            entry[19..23].copy_from_slice(&cue.cluster_position.to_be_bytes());
            entry[23..25].copy_from_slice(&[0xf0, 0x84]); // CueRelativePosition
            entry[25..29].copy_from_slice(&cue.relative_position.to_be_bytes());
            self.out.write_all(&entry)?;
        }

        let end = self.out.stream_position()?;
        self.patch(size_field, 0x1000_0000 | (end - cues_start - 8) as u32)?;

        let cues_position = self
            .cues_position
            .take()
            .expect("cues position already patched");
        self.patch(cues_position, (cues_start - SEGMENT_BODY_START) as u32)?;

        let end = self.out.seek(SeekFrom::End(0))?;
        let segment_size = self
            .segment_size
            .take()
            .expect("segment size already patched");
        self.patch(segment_size, 0x1000_0000 | (end - SEGMENT_BODY_START) as u32)?;

        self.out.flush()?;
        Ok(self.out)
    }

    /// Seek-and-write resolution of a deferred field, restoring the write
    /// position afterwards.
    fn patch(&mut self, field: Deferred, value: u32) -> Result<()> {
        let resume = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(field.0))?;
        self.out.write_all(&value.to_be_bytes())?;
        self.out.seek(SeekFrom::Start(resume))?;
        Ok(())
    }
}

fn build_scaffold(track: &TrackParams) -> Result<(Vec<u8>, u64, u64)> {
    // AVCDecoderConfigurationRecord: 6 fixed bytes, one SPS, one PPS.
    let avcrec_len = 11 + track.sps.len() + track.pps.len();
    if avcrec_len > 126 {
        return Err(Error::AvcConfigTooLarge(avcrec_len));
    }
    let entry_len = 48 + avcrec_len;
    if entry_len > 126 {
        return Err(Error::TrackEntryTooLarge(entry_len));
    }
    let tracks_len = 2 + entry_len;
    if tracks_len > 126 {
        return Err(Error::TracksTooLarge(tracks_len));
    }

    let app = track.app_name.as_bytes();
    let app = &app[..app.len().min(MAX_APP_NAME)];
    let info_len = 13 + 2 * app.len();

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(&EBML_HEADER);

    let segment_size_at = (buf.len() + 4) as u64;
    buf.extend_from_slice(&[0x18, 0x53, 0x80, 0x67, 0x00, 0x00, 0x00, 0x00]);
    debug_assert_eq!(buf.len() as u64, SEGMENT_BODY_START);

    // SeekHead. Tracks and Info positions follow from the scaffold layout;
    // the Cues position is patched at finalization.
    let tracks_pos = 50u8;
    let info_pos = (50 + 5 + tracks_len) as u8;
    buf.extend_from_slice(&[0x11, 0x4d, 0x9b, 0x74, 0xad]);
    buf.extend_from_slice(&[
        0x4d, 0xbb, 0x8b, // Seek
        0x53, 0xab, 0x84, 0x16, 0x54, 0xae, 0x6b, // SeekID: Tracks
        0x53, 0xac, 0x81, tracks_pos, // SeekPosition
    ]);
    buf.extend_from_slice(&[
        0x4d, 0xbb, 0x8b, //
        0x53, 0xab, 0x84, 0x15, 0x49, 0xa9, 0x66, // SeekID: Info
        0x53, 0xac, 0x81, info_pos,
    ]);
    buf.extend_from_slice(&[
        0x4d, 0xbb, 0x8e, //
        0x53, 0xab, 0x84, 0x1c, 0x53, 0xbb, 0x6b, // SeekID: Cues
        0x53, 0xac, 0x84,
    ]);
    let cues_position_at = buf.len() as u64;
    buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

    // Tracks, one video entry.
    buf.extend_from_slice(&[0x16, 0x54, 0xae, 0x6b, 0x80 | tracks_len as u8]);
    buf.extend_from_slice(&[0xae, 0x80 | entry_len as u8]);
    buf.extend_from_slice(&[0xd7, 0x81, 0x01]); // TrackNumber
    buf.extend_from_slice(&[0x73, 0xc5, 0x81, 0x01]); // TrackUID
    buf.extend_from_slice(&[0x83, 0x81, 0x01]); // TrackType: video
    buf.extend_from_slice(&[0x23, 0xe3, 0x83, 0x84]); // DefaultDuration
    buf.extend_from_slice(&track.default_duration_ns.to_be_bytes());
    buf.extend_from_slice(&[0xe0, 0x88]); // Video
    buf.extend_from_slice(&[0xb0, 0x82]); // PixelWidth
    buf.extend_from_slice(&track.width.to_be_bytes());
    buf.extend_from_slice(&[0xba, 0x82]); // PixelHeight
    buf.extend_from_slice(&track.height.to_be_bytes());
    buf.extend_from_slice(&[0x86, 0x8f]); // CodecID
    buf.extend_from_slice(b"V_MPEG4/ISO/AVC");
    buf.extend_from_slice(&[0x63, 0xa2, 0x80 | avcrec_len as u8]); // CodecPrivate
    buf.extend_from_slice(&[0x01, 0x42, 0xc0, 0x1f, 0xff, 0xe1]);
    buf.extend_from_slice(&(track.sps.len() as u16).to_be_bytes());
    buf.extend_from_slice(track.sps);
    buf.push(0x01);
    buf.extend_from_slice(&(track.pps.len() as u16).to_be_bytes());
    buf.extend_from_slice(track.pps);

    // Info: timestamp scale 1, so every tick value is in nanoseconds.
    buf.extend_from_slice(&[0x15, 0x49, 0xa9, 0x66, 0x80 | info_len as u8]);
    buf.extend_from_slice(&[0x2a, 0xd7, 0xb1, 0x83, 0x00, 0x00, 0x01]);
    buf.extend_from_slice(&[0x4d, 0x80, 0x80 | app.len() as u8]); // MuxingApp
    buf.extend_from_slice(app);
    buf.extend_from_slice(&[0x57, 0x41, 0x80 | app.len() as u8]); // WritingApp
    buf.extend_from_slice(app);

    Ok((buf, segment_size_at, cues_position_at))
}

#[cfg(test)]
mod test {
    use super::cues::Cue;
    use super::*;
    use std::io::Cursor;

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f, 0x8c];
    const PPS: &[u8] = &[0x68, 0xce, 0x06, 0xe2];

    fn track() -> TrackParams<'static> {
        TrackParams {
            width: 640,
            height: 480,
            default_duration_ns: 16_666_667,
            sps: SPS,
            pps: PPS,
            app_name: "muxtest",
        }
    }

    fn be32(buf: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn be64(buf: &[u8], at: usize) -> u64 {
        u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
    }

    fn new_muxer() -> Muxer<Cursor<Vec<u8>>> {
        Muxer::new(Cursor::new(Vec::new()), &track()).unwrap()
    }

    #[test]
    fn scaffold_layout() {
        let muxer = new_muxer();
        let buf = muxer.out.into_inner();

        // EBML header, then the Segment with a zeroed size field.
        assert_eq!(&buf[0..4], &[0x1a, 0x45, 0xdf, 0xa3]);
        assert_eq!(&buf[40..44], &[0x18, 0x53, 0x80, 0x67]);
        assert_eq!(be32(&buf, 44), 0);

        let body = SEGMENT_BODY_START as usize;
        assert_eq!(body, 48);

        // SeekHead first, with a 45-byte body.
        assert_eq!(&buf[body..body + 5], &[0x11, 0x4d, 0x9b, 0x74, 0xad]);

        // Its Tracks position points at the actual Tracks element.
        let tracks_pos = buf[body + 18] as usize;
        assert_eq!(tracks_pos, 50);
        assert_eq!(
            &buf[body + tracks_pos..body + tracks_pos + 4],
            &[0x16, 0x54, 0xae, 0x6b]
        );

        // Same for Info.
        let info_pos = buf[body + 32] as usize;
        assert_eq!(
            &buf[body + info_pos..body + info_pos + 4],
            &[0x15, 0x49, 0xa9, 0x66]
        );

        // The Cues position is still a 4-byte hole.
        assert_eq!(be32(&buf, body + 46), 0);

        // The scaffold ends right after the Info element.
        let info_len = (buf[body + info_pos + 4] & 0x7f) as usize;
        assert_eq!(buf.len(), body + info_pos + 5 + info_len);
    }

    #[test]
    fn tracks_carry_one_avc_config_record() {
        let muxer = new_muxer();
        let buf = muxer.out.into_inner();

        let body = SEGMENT_BODY_START as usize;
        let tracks = body + 50;

        let avcrec_len = 11 + SPS.len() + PPS.len();
        assert_eq!(buf[tracks + 4], 0x80 | (2 + 48 + avcrec_len) as u8);
        assert_eq!(buf[tracks + 6], 0x80 | (48 + avcrec_len) as u8);

        // PixelWidth/PixelHeight inside the Video element.
        let video = tracks + 7 + 3 + 4 + 3 + 8;
        assert_eq!(&buf[video..video + 2], &[0xe0, 0x88]);
        assert_eq!(u16::from_be_bytes([buf[video + 4], buf[video + 5]]), 640);
        assert_eq!(u16::from_be_bytes([buf[video + 8], buf[video + 9]]), 480);

        // CodecPrivate follows CodecID.
        let private = video + 10 + 17;
        assert_eq!(buf[private], 0x63);
        assert_eq!(buf[private + 1], 0xa2);
        assert_eq!(buf[private + 2], 0x80 | avcrec_len as u8);

        let avcrec = &buf[private + 3..private + 3 + avcrec_len];
        assert_eq!(&avcrec[0..6], &[0x01, 0x42, 0xc0, 0x1f, 0xff, 0xe1]);
        assert_eq!(
            u16::from_be_bytes([avcrec[6], avcrec[7]]) as usize,
            SPS.len()
        );
        assert_eq!(&avcrec[8..8 + SPS.len()], SPS);
        let pps_at = 8 + SPS.len();
        assert_eq!(avcrec[pps_at], 0x01);
        assert_eq!(
            u16::from_be_bytes([avcrec[pps_at + 1], avcrec[pps_at + 2]]) as usize,
            PPS.len()
        );
        assert_eq!(&avcrec[pps_at + 3..], PPS);
    }

    #[test]
    fn oversized_parameter_sets_are_rejected() {
        fn try_new(sps: &[u8], pps: &[u8]) -> Result<Muxer<Cursor<Vec<u8>>>> {
            Muxer::new(
                Cursor::new(Vec::new()),
                &TrackParams {
                    width: 640,
                    height: 480,
                    default_duration_ns: 16_666_667,
                    sps,
                    pps,
                    app_name: "muxtest",
                },
            )
        }

        let big = vec![0u8; 120];
        assert!(matches!(
            try_new(&big, PPS),
            Err(Error::AvcConfigTooLarge(_))
        ));

        // Large but within the record limit still overflows the entry.
        let medium = vec![0u8; 60];
        assert!(matches!(
            try_new(&medium, &medium[..50]),
            Err(Error::TrackEntryTooLarge(_))
        ));
    }

    #[test]
    fn cluster_size_is_back_patched() {
        let mut muxer = new_muxer();
        muxer.open_cluster(0).unwrap();
        let cluster_at = SEGMENT_BODY_START as usize + muxer.cluster_position() as usize;

        muxer.write_block(0, &[0x11; 20]).unwrap();
        muxer.write_block(100, &[0x22; 7]).unwrap();
        muxer.close_cluster().unwrap();

        let buf = muxer.out.into_inner();
        assert_eq!(&buf[cluster_at..cluster_at + 4], &[0x1f, 0x43, 0xb6, 0x75]);

        let size = be32(&buf, cluster_at + 4) & 0x0fff_ffff;
        let expected = 10 + (20 + 9) + (7 + 9);
        assert_eq!(size, expected);

        // The size spans exactly from the end of the field to the cluster end.
        assert_eq!(buf.len(), cluster_at + 8 + expected as usize);

        // Timestamp element and first block framing.
        assert_eq!(&buf[cluster_at + 8..cluster_at + 10], &[0xe7, 0x88]);
        assert_eq!(be64(&buf, cluster_at + 10), 0);
        let block = cluster_at + 18;
        assert_eq!(buf[block], 0xa3);
        assert_eq!(be32(&buf, block + 1), 0x1000_0000 | 24);
        assert_eq!(&buf[block + 5..block + 9], &[0x81, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn finish_back_patches_segment_and_cues() {
        let mut muxer = new_muxer();
        muxer.open_cluster(0).unwrap();
        let cluster_pos = muxer.cluster_position();
        let block_at = muxer.block_offset();
        muxer.write_block(0, &[0x33; 12]).unwrap();

        let mut index = CueIndex::new();
        index.push(Cue {
            timestamp: 0,
            cluster_position: cluster_pos,
            relative_position: block_at,
        });

        let buf = muxer.finish(&index).unwrap().into_inner();
        let body = SEGMENT_BODY_START as usize;

        // Segment size covers everything after the segment header.
        assert_eq!(
            be32(&buf, 44),
            0x1000_0000 | (buf.len() - body) as u32
        );

        // The SeekHead Cues hole now points at the Cues element.
        let cues_pos = be32(&buf, body + 46) as usize;
        let cues = body + cues_pos;
        assert_eq!(&buf[cues..cues + 4], &[0x1c, 0x53, 0xbb, 0x6b]);

        // Cues size covers its body exactly.
        let cues_size = (be32(&buf, cues + 4) & 0x0fff_ffff) as usize;
        assert_eq!(buf.len(), cues + 8 + cues_size);
        assert_eq!(cues_size, 29);

        // The single CuePoint round-trips the cue fields.
        let point = cues + 8;
        assert_eq!(&buf[point..point + 2], &[0xbb, 0x9b]);
        assert_eq!(be64(&buf, point + 4), 0);
        assert_eq!(be32(&buf, point + 19), cluster_pos);
        assert_eq!(be32(&buf, point + 25), 10);
    }
}
