//! VITA-49 frame builders.
//!
//! Frames use the layout FlexRadio transmits: extension data with stream
//! id, class id present, integer and fractional timestamps, no trailer. The
//! payload is padded to a whole number of 32-bit words.

/// FlexRadio OUI.
pub const FLEX_OUI: u32 = 0x001C2D;

/// FlexRadio information class code.
pub const FLEX_INFO_CLASS: u16 = 0x534C;

/// Packet class code of discovery broadcasts.
pub const DISCOVERY_CLASS: u16 = 0xFFFF;

/// Stream id FlexRadio puts on discovery broadcasts.
pub const DISCOVERY_STREAM_ID: u32 = 0x0000_0800;

const HEADER_LEN: usize = 28;

/// Build a frame with the given class code, stream id and payload.
pub fn data_frame(class_code: u16, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    frame(FLEX_OUI, class_code, stream_id, payload)
}

/// Build a discovery broadcast carrying `text` as its payload.
pub fn discovery_frame(text: &str) -> Vec<u8> {
    frame(FLEX_OUI, DISCOVERY_CLASS, DISCOVERY_STREAM_ID, text.as_bytes())
}

/// Build a frame with an arbitrary OUI.
pub fn frame(oui: u32, class_code: u16, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut padded = payload.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }

    let size_words = ((HEADER_LEN + padded.len()) / 4) as u16;
    // Type 3 (extension data with stream id), C=1, T=0, TSI=1 (UTC),
    // TSF=1 (sample count).
    let header: u32 = (0x3 << 28) | (1 << 27) | (0x1 << 22) | (0x1 << 20) | u32::from(size_words);

    let mut pkt = Vec::with_capacity(HEADER_LEN + padded.len());
    pkt.extend_from_slice(&header.to_be_bytes());
    pkt.extend_from_slice(&stream_id.to_be_bytes());
    pkt.extend_from_slice(&(oui & 0x00FF_FFFF).to_be_bytes());
    pkt.extend_from_slice(&((u32::from(FLEX_INFO_CLASS) << 16) | u32::from(class_code)).to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.extend_from_slice(&0u64.to_be_bytes());
    pkt.extend_from_slice(&padded);
    pkt
}
