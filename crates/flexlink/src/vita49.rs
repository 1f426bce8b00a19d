//! VITA-49.0 frame decoder.
//!
//! FlexRadio wraps discovery broadcasts and every UDP data stream (meters,
//! panadapter, waterfall, DAX audio and IQ) in VITA-49.0 packets. This
//! module is a pure decoder: it validates the header, works out which
//! optional fields the flags declare, and exposes the payload as a slice
//! of the caller's buffer. Nothing here performs I/O or keeps state.
//!
//! Malformed input is returned as [`Error::Protocol`]; receive loops log it
//! and drop the datagram.

use bytes::Bytes;

use flexlink_core::{Error, Result};

/// Size of the header word.
pub const HEADER_WORD_SIZE: usize = 4;

/// Size of the header FlexRadio sends: header word, stream id, class id,
/// integer timestamp and fractional timestamp.
pub const FLEX_HEADER_SIZE: usize = 28;

/// FlexRadio OUI (Organizationally Unique Identifier).
pub const FLEXRADIO_OUI: u32 = 0x001C2D;

/// Information class code FlexRadio puts in every class id.
pub const FLEXRADIO_INFO_CLASS: u16 = 0x534C;

/// Packet class code of discovery broadcasts.
pub const DISCOVERY_CLASS_CODE: u16 = 0xFFFF;

/// Stream type identified by the Packet Class Code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Meter data -- class code 0x8002.
    MeterData,
    /// FFT / panadapter data -- class code 0x8003.
    Fft,
    /// Waterfall data -- class code 0x8004.
    Waterfall,
    /// Opus compressed audio -- class code 0x8005.
    OpusAudio,
    /// DAX IQ at 24 ksps -- class code 0x02E3.
    DaxIq24,
    /// DAX IQ at 48 ksps -- class code 0x02E4.
    DaxIq48,
    /// DAX IQ at 96 ksps -- class code 0x02E5.
    DaxIq96,
    /// DAX IQ at 192 ksps -- class code 0x02E6.
    DaxIq192,
    /// DAX audio, 24 ksps stereo float32 -- class code 0x03E3.
    DaxAudio,
    /// Discovery broadcast -- class code 0xFFFF.
    Discovery,
    /// Unrecognized class code.
    Unknown(u16),
}

/// Derive the stream type from a Packet Class Code.
pub fn stream_type_from_class_code(code: u16) -> StreamType {
    match code {
        0x8002 => StreamType::MeterData,
        0x8003 => StreamType::Fft,
        0x8004 => StreamType::Waterfall,
        0x8005 => StreamType::OpusAudio,
        0x02E3 => StreamType::DaxIq24,
        0x02E4 => StreamType::DaxIq48,
        0x02E5 => StreamType::DaxIq96,
        0x02E6 => StreamType::DaxIq192,
        0x03E3 => StreamType::DaxAudio,
        DISCOVERY_CLASS_CODE => StreamType::Discovery,
        other => StreamType::Unknown(other),
    }
}

/// VITA-49 packet type (bits 31-28 of the header word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// IF data without stream id (0).
    IfData,
    /// IF data with stream id (1).
    IfDataWithStream,
    /// Extension data without stream id (2).
    ExtData,
    /// Extension data with stream id (3). Used by FlexRadio.
    ExtDataWithStream,
}

impl PacketType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketType::IfData),
            1 => Some(PacketType::IfDataWithStream),
            2 => Some(PacketType::ExtData),
            3 => Some(PacketType::ExtDataWithStream),
            _ => None,
        }
    }

    /// Whether packets of this type carry a stream id word.
    pub fn has_stream_id(self) -> bool {
        matches!(
            self,
            PacketType::IfDataWithStream | PacketType::ExtDataWithStream
        )
    }

    fn bits(self) -> u8 {
        match self {
            PacketType::IfData => 0,
            PacketType::IfDataWithStream => 1,
            PacketType::ExtData => 2,
            PacketType::ExtDataWithStream => 3,
        }
    }
}

/// Class id fields, present when the header's C bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassId {
    /// 24-bit OUI. 0x001C2D for FlexRadio.
    pub oui: u32,
    /// Information Class Code.
    pub info_class_code: u16,
    /// Packet Class Code identifying the stream type.
    pub packet_class_code: u16,
}

/// Parsed VITA-49 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vita49Header {
    pub packet_type: PacketType,
    pub trailer_present: bool,
    /// Integer timestamp type (bits 23-22). Zero means absent.
    pub tsi: u8,
    /// Fractional timestamp type (bits 21-20). Zero means absent.
    pub tsf: u8,
    /// 4-bit rolling packet counter (bits 19-16).
    pub packet_count: u8,
    /// Total packet size in 32-bit words, including header (bits 15-0).
    pub packet_size_words: u16,
    pub stream_id: Option<u32>,
    pub class_id: Option<ClassId>,
    pub timestamp_int: Option<u32>,
    pub timestamp_frac: Option<u64>,
    /// Size of the header in bytes, i.e. the payload offset.
    pub header_len: usize,
}

impl Vita49Header {
    /// Whether a class id is present.
    pub fn class_id_present(&self) -> bool {
        self.class_id.is_some()
    }

    /// Stream type from the class code, if a class id is present.
    pub fn stream_type(&self) -> Option<StreamType> {
        self.class_id
            .map(|c| stream_type_from_class_code(c.packet_class_code))
    }

    /// Whether this is a discovery broadcast.
    pub fn is_discovery(&self) -> bool {
        self.stream_type() == Some(StreamType::Discovery)
    }
}

/// A decoded packet: header plus the payload slice of the input buffer.
#[derive(Debug, PartialEq)]
pub struct Vita49Packet<'a> {
    pub header: Vita49Header,
    pub payload: &'a [u8],
}

impl Vita49Packet<'_> {
    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Copy the packet into an owned frame that can outlive the receive
    /// buffer.
    pub fn to_owned_frame(&self) -> OwnedPacket {
        OwnedPacket {
            header: self.header.clone(),
            payload: Bytes::copy_from_slice(self.payload),
        }
    }
}

/// A decoded packet that owns its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedPacket {
    pub header: Vita49Header,
    pub payload: Bytes,
}

fn word(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decode a VITA-49 packet from a raw datagram.
///
/// The declared packet size must fit in the buffer and must be large
/// enough for every field the header flags declare (plus the trailer).
/// Bytes beyond the declared size are ignored.
pub fn parse_packet(data: &[u8]) -> Result<Vita49Packet<'_>> {
    if data.len() < HEADER_WORD_SIZE {
        return Err(Error::Protocol(format!(
            "VITA-49 packet too short: {} bytes, minimum is {}",
            data.len(),
            HEADER_WORD_SIZE
        )));
    }

    let header_word = word(data, 0);
    let type_bits = ((header_word >> 28) & 0x0F) as u8;
    let packet_type = PacketType::from_bits(type_bits).ok_or_else(|| {
        Error::Protocol(format!("unsupported VITA-49 packet type {type_bits}"))
    })?;
    let class_id_present = (header_word >> 27) & 1 == 1;
    let trailer_present = (header_word >> 26) & 1 == 1;
    let tsi = ((header_word >> 22) & 0x03) as u8;
    let tsf = ((header_word >> 20) & 0x03) as u8;
    let packet_count = ((header_word >> 16) & 0x0F) as u8;
    let packet_size_words = (header_word & 0xFFFF) as u16;

    let header_len = HEADER_WORD_SIZE
        + if packet_type.has_stream_id() { 4 } else { 0 }
        + if class_id_present { 8 } else { 0 }
        + if tsi != 0 { 4 } else { 0 }
        + if tsf != 0 { 8 } else { 0 };
    let trailer_len = if trailer_present { 4 } else { 0 };

    if data.len() < header_len {
        return Err(Error::Protocol(format!(
            "VITA-49 packet too short: {} bytes, header needs {}",
            data.len(),
            header_len
        )));
    }

    let packet_size_bytes = packet_size_words as usize * 4;
    if packet_size_bytes > data.len() {
        return Err(Error::Protocol(format!(
            "VITA-49 packet_size ({} words = {} bytes) exceeds buffer length ({} bytes)",
            packet_size_words,
            packet_size_bytes,
            data.len()
        )));
    }
    if packet_size_bytes < header_len + trailer_len {
        return Err(Error::Protocol(format!(
            "VITA-49 packet_size ({packet_size_bytes} bytes) smaller than its header ({} bytes)",
            header_len + trailer_len
        )));
    }

    let mut offset = HEADER_WORD_SIZE;

    let stream_id = if packet_type.has_stream_id() {
        let id = word(data, offset);
        offset += 4;
        Some(id)
    } else {
        None
    };

    let class_id = if class_id_present {
        let upper = word(data, offset);
        let lower = word(data, offset + 4);
        offset += 8;
        let oui = upper & 0x00FF_FFFF;
        if oui != FLEXRADIO_OUI {
            tracing::warn!(
                oui = oui,
                expected = FLEXRADIO_OUI,
                "VITA-49 packet OUI does not match FlexRadio"
            );
        }
        Some(ClassId {
            oui,
            info_class_code: (lower >> 16) as u16,
            packet_class_code: (lower & 0xFFFF) as u16,
        })
    } else {
        None
    };

    let timestamp_int = if tsi != 0 {
        let ts = word(data, offset);
        offset += 4;
        Some(ts)
    } else {
        None
    };

    let timestamp_frac = if tsf != 0 {
        let ts = (u64::from(word(data, offset)) << 32) | u64::from(word(data, offset + 4));
        offset += 8;
        Some(ts)
    } else {
        None
    };

    debug_assert_eq!(offset, header_len);

    let header = Vita49Header {
        packet_type,
        trailer_present,
        tsi,
        tsf,
        packet_count,
        packet_size_words,
        stream_id,
        class_id,
        timestamp_int,
        timestamp_frac,
        header_len,
    };

    let payload = &data[header_len..packet_size_bytes - trailer_len];
    Ok(Vita49Packet { header, payload })
}

/// Build the header word for a packet. Exposed for senders and tests that
/// need to produce frames in the layout FlexRadio uses.
pub fn header_word(
    packet_type: PacketType,
    class_id_present: bool,
    trailer_present: bool,
    tsi: u8,
    tsf: u8,
    packet_count: u8,
    packet_size_words: u16,
) -> u32 {
    (u32::from(packet_type.bits()) << 28)
        | (u32::from(class_id_present) << 27)
        | (u32::from(trailer_present) << 26)
        | (u32::from(tsi & 0x03) << 22)
        | (u32::from(tsf & 0x03) << 20)
        | (u32::from(packet_count & 0x0F) << 16)
        | u32::from(packet_size_words)
}
