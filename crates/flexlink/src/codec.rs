//! Command channel line encoding and decoding.
//!
//! The radio's control protocol uses newline-terminated ASCII lines over
//! TCP. Commands flow from client to radio; replies, status updates,
//! messages and the connect-time handshake flow back.
//!
//! # Line formats
//!
//! ```text
//! Command:   C<seq>|<command_text>\n        (CD<seq>|... with the diagnostic flag)
//! Reply:     R<seq>|<hex_error_code>|<reply_data>\n
//! Status:    S<hex_handle>|<object> <key>=<value> ...\n
//! Message:   M<hex_code>|<text>\n
//! Version:   V<major>.<minor>.<patch>.<build>\n
//! Handle:    H<hex_handle>\n
//! ```
//!
//! The lead character of inbound lines is matched case-insensitively. All
//! functions here are pure; no I/O is performed.

use flexlink_core::{Error, Result};

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

/// Encode a command with the given sequence number.
///
/// Format: `C<seq>|<command>\n`, or `CD<seq>|<command>\n` when `diagnostic`
/// is set.
pub fn encode_command(seq: u64, command: &str, diagnostic: bool) -> Vec<u8> {
    let flag = if diagnostic { "D" } else { "" };
    format!("C{flag}{seq}|{command}\n").into_bytes()
}

// ---------------------------------------------------------------------------
// Command builders
//
// Each builder returns the command text WITHOUT the `C<seq>|` prefix. The
// prefix is added by the command channel when it assigns a sequence number.
// ---------------------------------------------------------------------------

/// Example output: `"info"`
pub fn cmd_info() -> String {
    "info".to_string()
}

/// Example output: `"version"`
pub fn cmd_version() -> String {
    "version".to_string()
}

/// Build a subscribe command.
///
/// Example output: `"sub client all"`
pub fn cmd_subscribe(object: &str) -> String {
    format!("sub {object}")
}

/// Build a client program registration command.
///
/// Example output: `"client program flexlink"`
pub fn cmd_client_program(name: &str) -> String {
    format!("client program {name}")
}

/// Announce this client as a GUI client.
pub fn cmd_client_gui() -> String {
    "client gui".to_string()
}

/// Register a UDP stream endpoint for a client handle.
///
/// Example output: `"client udp_register handle=0x40000001"`
pub fn cmd_udp_register(handle: u32) -> String {
    format!("client udp_register handle=0x{handle:08X}")
}

/// Validate a SmartLink connection with the handle from `connect_ready`.
///
/// Example output: `"wan validate handle=ABCDEF"`
pub fn cmd_wan_validate(handle: &str) -> String {
    format!("wan validate handle={handle}")
}

// ---------------------------------------------------------------------------
// Inbound line types
// ---------------------------------------------------------------------------

/// A reply to a previously sent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Sequence number correlating this reply to the originating command.
    pub sequence: u64,
    /// `0` means success; non-zero is a radio error code.
    pub error_code: u32,
    /// Reply data (may be empty).
    pub message: String,
}

impl CommandReply {
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// An unsolicited status update.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// The client handle this status was sent to.
    pub handle: u32,
    /// The object type and optional identifier (e.g. `"client 0x40000001"`,
    /// `"radio"`).
    pub object: String,
    /// Key-value pairs in line order.
    pub params: Vec<(String, String)>,
}

impl StatusUpdate {
    /// Look up a parameter by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Protocol version announced when the connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Lines received on the command channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// `V1.4.0.0`
    Version(ProtocolVersion),
    /// `H12345678`
    Handle(u32),
    /// `R<seq>|<error>|<data>`
    Reply(CommandReply),
    /// `S<handle>|<object> <kv>...`
    Status(StatusUpdate),
    /// `M<code>|<text>`
    Message { code: u32, text: String },
    /// Any other lead character.
    Unknown(String),
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// Parse one received line.
///
/// The line should NOT include the trailing `\n`. Leading and trailing
/// whitespace is stripped.
pub fn parse_line(line: &str) -> Result<InboundLine> {
    let line = line.trim();
    let Some(first) = line.chars().next() else {
        return Err(Error::Protocol("empty line".into()));
    };

    let body = &line[first.len_utf8()..];
    match first.to_ascii_uppercase() {
        'V' => parse_version(line, body),
        'H' => parse_handle(body),
        'R' => parse_reply(line, body),
        'S' => parse_status(line, body),
        'M' => parse_message(line, body),
        _ => Ok(InboundLine::Unknown(line.to_string())),
    }
}

fn parse_version(line: &str, body: &str) -> Result<InboundLine> {
    let parts: Vec<&str> = body.split('.').collect();
    if parts.len() != 4 {
        return Err(Error::Protocol(format!("invalid version format: {line}")));
    }

    let parse_u32 = |s: &str| -> Result<u32> {
        s.parse::<u32>()
            .map_err(|_| Error::Protocol(format!("invalid version number: {s}")))
    };

    Ok(InboundLine::Version(ProtocolVersion {
        major: parse_u32(parts[0])?,
        minor: parse_u32(parts[1])?,
        patch: parse_u32(parts[2])?,
        build: parse_u32(parts[3])?,
    }))
}

fn parse_handle(body: &str) -> Result<InboundLine> {
    let handle = flexlink_core::parse_handle(body)
        .ok_or_else(|| Error::Protocol(format!("invalid hex handle: {body}")))?;
    Ok(InboundLine::Handle(handle))
}

fn parse_reply(line: &str, body: &str) -> Result<InboundLine> {
    let parts: Vec<&str> = body.splitn(3, '|').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!(
            "malformed reply (need at least seq|error): {line}"
        )));
    }

    let sequence = parts[0]
        .parse::<u64>()
        .map_err(|_| Error::Protocol(format!("invalid reply sequence number: {}", parts[0])))?;

    let error_code = u32::from_str_radix(parts[1], 16)
        .map_err(|_| Error::Protocol(format!("invalid reply error code: {}", parts[1])))?;

    let message = parts.get(2).map(|s| s.to_string()).unwrap_or_default();

    Ok(InboundLine::Reply(CommandReply {
        sequence,
        error_code,
        message,
    }))
}

fn parse_status(line: &str, body: &str) -> Result<InboundLine> {
    let (handle_str, payload) = body
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("malformed status (no pipe): {line}")))?;

    let handle = flexlink_core::parse_handle(handle_str)
        .ok_or_else(|| Error::Protocol(format!("invalid status handle: {handle_str}")))?;

    // The leading run of tokens without '=' names the object; the rest are
    // key=value pairs. Bare tokens after the first pair are ignored.
    let tokens: Vec<&str> = payload.split_whitespace().collect();
    let kv_start = tokens
        .iter()
        .position(|t| t.contains('='))
        .unwrap_or(tokens.len());

    let object = tokens[..kv_start].join(" ");
    let params = tokens[kv_start..]
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(InboundLine::Status(StatusUpdate {
        handle,
        object,
        params,
    }))
}

fn parse_message(line: &str, body: &str) -> Result<InboundLine> {
    let (code_str, text) = body
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("malformed message (no pipe): {line}")))?;

    let code = u32::from_str_radix(code_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid message code: {code_str}")))?;

    Ok(InboundLine::Message {
        code,
        text: text.to_string(),
    })
}
