//! Incremental Ogg-Opus stream parsing
//!
//! Synthesis engines hand back an Ogg-encapsulated Opus byte stream in
//! arbitrary chunk sizes. [`OggOpusParser::push`] appends bytes and returns
//! every unit that became complete: the identification header, the tags
//! block, audio packets (with their parsed TOC), and end-of-stream.
//!
//! The parser is a tolerant reader: it never errors on malformed input. A
//! missing `OggS` magic triggers a forward scan to the next capture pattern
//! (logged with the number of bytes discarded); a truncated page is simply
//! retained until the next call delivers the rest.

use tracing::{debug, warn};

const OGG_MAGIC: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// Opus identification header (`OpusHead`)
#[derive(Debug, Clone, PartialEq)]
pub struct OpusIdHeader {
    pub version: u8,
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub mapping_family: u8,
    /// Present when `mapping_family != 0`
    pub channel_mapping: Option<ChannelMapping>,
}

/// Multistream channel mapping table
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMapping {
    pub stream_count: u8,
    pub coupled_count: u8,
    pub mapping: Vec<u8>,
}

/// Opus comment block (`OpusTags`)
#[derive(Debug, Clone, PartialEq)]
pub struct OpusTags {
    pub vendor: String,
    pub comments: Vec<String>,
}

/// Coding mode from the TOC config number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpusMode {
    Silk,
    Hybrid,
    Celt,
}

/// Parsed TOC byte of an Opus packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpusToc {
    pub mode: OpusMode,
    /// Audio bandwidth label ("NB", "MB", "WB", "SWB", "FB")
    pub bandwidth: &'static str,
    pub stereo: bool,
    pub frame_count: u8,
    /// Duration of one frame in milliseconds
    pub frame_duration_ms: f32,
}

impl OpusToc {
    /// Parse the TOC byte (and frame-count byte for code-3 packets)
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let toc = *payload.first()?;
        let config = toc >> 3;
        let stereo = (toc >> 2) & 0x01 == 1;
        let code = toc & 0x03;

        let (mode, bandwidth, frame_duration_ms) = match config {
            0..=11 => {
                let bandwidth = ["NB", "MB", "WB"][(config / 4) as usize];
                let duration = [10.0, 20.0, 40.0, 60.0][(config % 4) as usize];
                (OpusMode::Silk, bandwidth, duration)
            }
            12..=15 => {
                let bandwidth = ["SWB", "FB"][((config - 12) / 2) as usize];
                let duration = [10.0, 20.0][(config % 2) as usize];
                (OpusMode::Hybrid, bandwidth, duration)
            }
            _ => {
                let bandwidth = ["NB", "WB", "SWB", "FB"][((config - 16) / 4) as usize];
                let duration = [2.5, 5.0, 10.0, 20.0][(config % 4) as usize];
                (OpusMode::Celt, bandwidth, duration)
            }
        };

        let frame_count = match code {
            0 => 1,
            1 | 2 => 2,
            _ => payload.get(1).map(|b| b & 0x3F)?,
        };

        Some(Self {
            mode,
            bandwidth,
            stereo,
            frame_count,
            frame_duration_ms,
        })
    }

    /// Total packet duration in milliseconds
    pub fn duration_ms(&self) -> f32 {
        self.frame_count as f32 * self.frame_duration_ms
    }
}

/// One reconstructed Opus audio packet
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub payload: Vec<u8>,
    /// Granule position of the carrying page (48kHz sample offset)
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub toc: Option<OpusToc>,
}

impl AudioPacket {
    /// Declared duration from the TOC, zero when the TOC is unreadable
    pub fn duration_ms(&self) -> f32 {
        self.toc.map(|t| t.duration_ms()).unwrap_or(0.0)
    }
}

/// A unit produced by the parser
#[derive(Debug, Clone)]
pub enum OggUnit {
    Header(OpusIdHeader),
    Tags(OpusTags),
    Audio(AudioPacket),
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ExpectHeader,
    ExpectTags,
    Audio,
}

/// Re-entrant Ogg-Opus page parser
pub struct OggOpusParser {
    buf: Vec<u8>,
    /// Partial packet continued across lacing segments/pages
    pending_packet: Vec<u8>,
    stage: Stage,
    /// Total bytes discarded while resynchronizing
    skipped_bytes: u64,
    ended: bool,
}

impl OggOpusParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pending_packet: Vec::new(),
            stage: Stage::ExpectHeader,
            skipped_bytes: 0,
            ended: false,
        }
    }

    /// Append stream bytes and return every newly completed unit
    pub fn push(&mut self, data: &[u8]) -> Vec<OggUnit> {
        self.buf.extend_from_slice(data);

        let mut units = Vec::new();
        while let Some(consumed) = self.parse_one_page(&mut units) {
            self.buf.drain(..consumed);
            if self.ended {
                break;
            }
        }
        units
    }

    /// Total bytes discarded during resynchronization so far
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Whether the end-of-stream page has been seen
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Parse a single complete page from the front of the buffer
    ///
    /// Returns the number of bytes consumed, or `None` when the buffer holds
    /// only a partial page (kept for the next call).
    fn parse_one_page(&mut self, units: &mut Vec<OggUnit>) -> Option<usize> {
        self.resync();

        if self.buf.len() < PAGE_HEADER_LEN {
            return None;
        }

        let header_type = self.buf[5];
        let granule_position = u64::from_le_bytes(self.buf[6..14].try_into().ok()?);
        let serial = u32::from_le_bytes(self.buf[14..18].try_into().ok()?);
        let sequence = u32::from_le_bytes(self.buf[18..22].try_into().ok()?);
        // Bytes 22..26 are the page CRC; surfaced nowhere and not verified,
        // resync on the capture pattern is the recovery mechanism.
        let segment_count = self.buf[26] as usize;

        let table_end = PAGE_HEADER_LEN + segment_count;
        if self.buf.len() < table_end {
            return None;
        }

        let segment_table = &self.buf[PAGE_HEADER_LEN..table_end];
        let body_len: usize = segment_table.iter().map(|&b| b as usize).sum();
        if self.buf.len() < table_end + body_len {
            return None;
        }

        // Fresh page without the continuation flag while a partial packet is
        // pending means the continuation got lost; drop the partial.
        if header_type & FLAG_CONTINUED == 0 && !self.pending_packet.is_empty() {
            warn!(
                "dropping {} byte partial packet with no continuation",
                self.pending_packet.len()
            );
            self.pending_packet.clear();
        }

        let bos = header_type & FLAG_BOS != 0;
        if bos && self.stage != Stage::ExpectHeader {
            debug!(serial, "new logical stream begins mid-session");
            self.stage = Stage::ExpectHeader;
            self.pending_packet.clear();
        }

        // Walk the lacing values: a value of 255 continues the packet into
        // the next segment (or next page, after the table is exhausted).
        let mut offset = table_end;
        let mut packets: Vec<Vec<u8>> = Vec::new();
        for &lacing in segment_table {
            let len = lacing as usize;
            self.pending_packet
                .extend_from_slice(&self.buf[offset..offset + len]);
            offset += len;
            if lacing < 255 {
                packets.push(std::mem::take(&mut self.pending_packet));
            }
        }

        for packet in packets {
            self.emit_packet(packet, granule_position, serial, sequence, units);
        }

        if header_type & FLAG_EOS != 0 {
            self.ended = true;
            units.push(OggUnit::StreamEnd);
        }

        Some(table_end + body_len)
    }

    /// Discard bytes until the buffer starts with the capture pattern
    fn resync(&mut self) {
        if self.buf.len() < 4 || self.buf.starts_with(OGG_MAGIC) {
            return;
        }

        let skip = match find_magic(&self.buf) {
            Some(pos) => pos,
            // No magic anywhere; keep the last 3 bytes in case the pattern
            // straddles the chunk boundary.
            None => self.buf.len() - 3,
        };

        if skip > 0 {
            self.skipped_bytes += skip as u64;
            warn!("ogg stream desync, discarded {} bytes", skip);
            self.buf.drain(..skip);
        }
    }

    fn emit_packet(
        &mut self,
        payload: Vec<u8>,
        granule_position: u64,
        serial: u32,
        sequence: u32,
        units: &mut Vec<OggUnit>,
    ) {
        match self.stage {
            Stage::ExpectHeader => {
                match parse_id_header(&payload) {
                    Some(header) => units.push(OggUnit::Header(header)),
                    None => warn!("malformed OpusHead packet ({} bytes), skipped", payload.len()),
                }
                self.stage = Stage::ExpectTags;
            }
            Stage::ExpectTags => {
                match parse_tags(&payload) {
                    Some(tags) => units.push(OggUnit::Tags(tags)),
                    None => warn!("malformed OpusTags packet ({} bytes), skipped", payload.len()),
                }
                self.stage = Stage::Audio;
            }
            Stage::Audio => {
                let toc = OpusToc::parse(&payload);
                if toc.is_none() {
                    debug!("audio packet with unreadable TOC ({} bytes)", payload.len());
                }
                units.push(OggUnit::Audio(AudioPacket {
                    payload,
                    granule_position,
                    serial,
                    sequence,
                    toc,
                }));
            }
        }
    }
}

impl Default for OggOpusParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == OGG_MAGIC)
}

fn parse_id_header(payload: &[u8]) -> Option<OpusIdHeader> {
    if payload.len() < 19 || &payload[..8] != b"OpusHead" {
        return None;
    }

    let version = payload[8];
    let channels = payload[9];
    let pre_skip = u16::from_le_bytes(payload[10..12].try_into().ok()?);
    let input_sample_rate = u32::from_le_bytes(payload[12..16].try_into().ok()?);
    let output_gain = i16::from_le_bytes(payload[16..18].try_into().ok()?);
    let mapping_family = payload[18];

    let channel_mapping = if mapping_family != 0 {
        let table = payload.get(19..21 + channels as usize)?;
        Some(ChannelMapping {
            stream_count: table[0],
            coupled_count: table[1],
            mapping: table[2..].to_vec(),
        })
    } else {
        None
    };

    Some(OpusIdHeader {
        version,
        channels,
        pre_skip,
        input_sample_rate,
        output_gain,
        mapping_family,
        channel_mapping,
    })
}

fn parse_tags(payload: &[u8]) -> Option<OpusTags> {
    if payload.len() < 12 || &payload[..8] != b"OpusTags" {
        return None;
    }

    let mut offset = 8;
    let vendor_len = read_u32(payload, &mut offset)? as usize;
    let vendor_bytes = payload.get(offset..offset + vendor_len)?;
    let vendor = String::from_utf8_lossy(vendor_bytes).into_owned();
    offset += vendor_len;

    let count = read_u32(payload, &mut offset)?;
    let mut comments = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let len = read_u32(payload, &mut offset)? as usize;
        let bytes = payload.get(offset..offset + len)?;
        comments.push(String::from_utf8_lossy(bytes).into_owned());
        offset += len;
    }

    Some(OpusTags { vendor, comments })
}

fn read_u32(payload: &[u8], offset: &mut usize) -> Option<u32> {
    let bytes = payload.get(*offset..*offset + 4)?;
    *offset += 4;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one Ogg page around the given packets (each ends a lacing run)
    fn page(header_type: u8, sequence: u32, packets: &[&[u8]]) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                segments.push(255u8);
                remaining -= 255;
            }
            segments.push(remaining as u8);
            body.extend_from_slice(packet);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0); // version
        out.push(header_type);
        out.extend_from_slice(&0u64.to_le_bytes()); // granule
        out.extend_from_slice(&0x1234u32.to_le_bytes()); // serial
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // crc, unverified
        out.push(segments.len() as u8);
        out.extend_from_slice(&segments);
        out.extend_from_slice(&body);
        out
    }

    fn opus_head() -> Vec<u8> {
        let mut p = b"OpusHead".to_vec();
        p.push(1); // version
        p.push(1); // channels
        p.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
        p.extend_from_slice(&16000u32.to_le_bytes());
        p.extend_from_slice(&0i16.to_le_bytes());
        p.push(0); // mapping family
        p
    }

    fn opus_tags() -> Vec<u8> {
        let mut p = b"OpusTags".to_vec();
        let vendor = b"voiceloop";
        p.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        p.extend_from_slice(vendor);
        p.extend_from_slice(&1u32.to_le_bytes());
        let comment = b"ENCODER=test";
        p.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        p.extend_from_slice(comment);
        p
    }

    /// TOC 0x18: config 3 (SILK NB 60ms), code 0, one frame
    fn audio_packet(len: usize) -> Vec<u8> {
        let mut p = vec![0x18];
        p.resize(len, 0xAB);
        p
    }

    #[test]
    fn test_header_tags_audio_sequence() {
        let mut parser = OggOpusParser::new();
        let mut stream = Vec::new();
        stream.extend(page(FLAG_BOS, 0, &[&opus_head()]));
        stream.extend(page(0, 1, &[&opus_tags()]));
        stream.extend(page(FLAG_EOS, 2, &[&audio_packet(40)]));

        let units = parser.push(&stream);
        assert_eq!(units.len(), 4);
        assert!(matches!(units[0], OggUnit::Header(_)));
        assert!(matches!(units[1], OggUnit::Tags(_)));
        assert!(matches!(units[2], OggUnit::Audio(_)));
        assert!(matches!(units[3], OggUnit::StreamEnd));
        assert!(parser.is_ended());

        if let OggUnit::Header(h) = &units[0] {
            assert_eq!(h.channels, 1);
            assert_eq!(h.pre_skip, 312);
            assert_eq!(h.input_sample_rate, 16000);
        }
        if let OggUnit::Tags(t) = &units[1] {
            assert_eq!(t.vendor, "voiceloop");
            assert_eq!(t.comments, vec!["ENCODER=test".to_string()]);
        }
    }

    #[test]
    fn test_partial_pages_retained() {
        let mut parser = OggOpusParser::new();
        let stream = page(FLAG_BOS, 0, &[&opus_head()]);

        // Feed byte by byte; nothing completes until the last byte
        let mut total = Vec::new();
        for &b in &stream[..stream.len() - 1] {
            total.extend(parser.push(&[b]));
        }
        assert!(total.is_empty());

        let units = parser.push(&stream[stream.len() - 1..]);
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0], OggUnit::Header(_)));
    }

    #[test]
    fn test_packet_spanning_pages() {
        let mut parser = OggOpusParser::new();
        parser.push(&page(FLAG_BOS, 0, &[&opus_head()]));
        parser.push(&page(0, 1, &[&opus_tags()]));

        // A 300-byte packet: first page carries one 255 lacing segment with
        // no terminator, the continuation page carries the remaining 45.
        let big = audio_packet(300);
        let mut first_page = Vec::new();
        first_page.extend_from_slice(b"OggS");
        first_page.push(0);
        first_page.push(0);
        first_page.extend_from_slice(&0u64.to_le_bytes());
        first_page.extend_from_slice(&0x1234u32.to_le_bytes());
        first_page.extend_from_slice(&2u32.to_le_bytes());
        first_page.extend_from_slice(&0u32.to_le_bytes());
        first_page.push(1);
        first_page.push(255);
        first_page.extend_from_slice(&big[..255]);

        let mut second_page = Vec::new();
        second_page.extend_from_slice(b"OggS");
        second_page.push(0);
        second_page.push(FLAG_CONTINUED);
        second_page.extend_from_slice(&0u64.to_le_bytes());
        second_page.extend_from_slice(&0x1234u32.to_le_bytes());
        second_page.extend_from_slice(&3u32.to_le_bytes());
        second_page.extend_from_slice(&0u32.to_le_bytes());
        second_page.push(1);
        second_page.push(45);
        second_page.extend_from_slice(&big[255..]);

        assert!(parser.push(&first_page).is_empty());
        let units = parser.push(&second_page);
        assert_eq!(units.len(), 1);
        match &units[0] {
            OggUnit::Audio(packet) => assert_eq!(packet.payload, big),
            other => panic!("expected audio packet, got {:?}", other),
        }
    }

    #[test]
    fn test_desync_resyncs_without_error() {
        let mut parser = OggOpusParser::new();
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00];
        stream.extend(page(FLAG_BOS, 0, &[&opus_head()]));

        let units = parser.push(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(parser.skipped_bytes(), 5);
    }

    #[test]
    fn test_toc_durations() {
        // config 3 = SILK NB 60ms, code 0 -> one frame
        let toc = OpusToc::parse(&[0x18, 0x00]).unwrap();
        assert_eq!(toc.mode, OpusMode::Silk);
        assert_eq!(toc.frame_duration_ms, 60.0);
        assert_eq!(toc.duration_ms(), 60.0);

        // config 28 = CELT FB 2.5ms, code 3 with 4 frames
        let toc = OpusToc::parse(&[0b1110_0011, 0x04]).unwrap();
        assert_eq!(toc.mode, OpusMode::Celt);
        assert_eq!(toc.frame_count, 4);
        assert_eq!(toc.duration_ms(), 10.0);

        // config 9 = SILK WB 20ms, code 1 -> two frames
        let toc = OpusToc::parse(&[0b0100_1001, 0x00]).unwrap();
        assert_eq!(toc.frame_count, 2);
        assert_eq!(toc.duration_ms(), 40.0);
    }
}
