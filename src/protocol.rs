//! Wire protocol framing: packet layout, per-version encryption selection,
//! CRC/HMAC/AEAD verification and partial-read reassembly.
//!
//! Each frame self-describes its family through the prefix magic: `0x000055AA`
//! for the v3.1–v3.4 layout and `0x00006699` for v3.5. Decoding dispatches on
//! the magic actually observed, never on previously assumed connection state.

use crate::crypto::{self, Cipher, GCM_NONCE_LEN, GCM_TAG_LEN};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

/// 55AA header: prefix, seqno, cmd, length.
const HEADER_LEN_55AA: usize = 16;
/// 6699 header: prefix, reserved u16, seqno, cmd, length.
const HEADER_LEN_6699: usize = 18;
/// Smallest parseable frame (55AA header + CRC + suffix).
const MIN_FRAME_LEN: usize = 24;
/// Upper bound on a declared payload length; larger values are stream garbage.
const MAX_PAYLOAD_LEN: u32 = 0x0004_0000;

/// Literal a device answers with when it does not support DP_QUERY.
const DATA_UNVALID: &[u8] = b"data unvalid";

/// Protocol versions spoken on the local network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V3_1,
    V3_3,
    V3_4,
    V3_5,
}

impl Version {
    /// The three ASCII bytes prepended to marked payloads (e.g. `b"3.4"`).
    pub fn marker(&self) -> &'static [u8; 3] {
        match self {
            Version::V3_1 => b"3.1",
            Version::V3_3 => b"3.3",
            Version::V3_4 => b"3.4",
            Version::V3_5 => b"3.5",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V3_1 => "3.1",
            Version::V3_3 => "3.3",
            Version::V3_4 => "3.4",
            Version::V3_5 => "3.5",
        }
    }

    pub fn val(&self) -> f32 {
        match self {
            Version::V3_1 => 3.1,
            Version::V3_3 => 3.3,
            Version::V3_4 => 3.4,
            Version::V3_5 => 3.5,
        }
    }

    /// v3.4 replaces the CRC32 trailer with HMAC-SHA256 under the session key.
    pub fn uses_hmac(&self) -> bool {
        matches!(self, Version::V3_4)
    }

    /// v3.5 frames carry a GCM tag instead of a separate trailer.
    pub fn uses_gcm(&self) -> bool {
        matches!(self, Version::V3_5)
    }

    /// Versions that (re)negotiate a session key after connect.
    pub fn negotiates_session_key(&self) -> bool {
        self.val() >= 3.4
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3.1" => Ok(Version::V3_1),
            "3.3" => Ok(Version::V3_3),
            "3.4" => Ok(Version::V3_4),
            "3.5" => Ok(Version::V3_5),
            other => Err(TuyaError::Framing(format!("unknown version '{}'", other))),
        }
    }
}

// Serialized as the wire string ("3.4"), matching discovery announcements.
impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Command codes as carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    Udp = 0x00,
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    DpRefresh = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    BroadcastLpv34 = 0x23,
    ReqDevInfo = 0x25,
    LanExtStream = 0x40,
}

impl CommandType {
    pub fn from_wire(code: u32) -> Option<Self> {
        use CommandType::*;
        Some(match code {
            0x00 => Udp,
            0x01 => ApConfig,
            0x02 => Active,
            0x03 => SessKeyNegStart,
            0x04 => SessKeyNegResp,
            0x05 => SessKeyNegFinish,
            0x06 => Unbind,
            0x07 => Control,
            0x08 => Status,
            0x09 => HeartBeat,
            0x0a => DpQuery,
            0x0b => QueryWifi,
            0x0c => TokenBind,
            0x0d => ControlNew,
            0x0e => EnableWifi,
            0x0f => WifiInfo,
            0x10 => DpQueryNew,
            0x11 => SceneExecute,
            0x12 => DpRefresh,
            0x13 => UdpNew,
            0x14 => ApConfigNew,
            0x23 => BroadcastLpv34,
            0x25 => ReqDevInfo,
            0x40 => LanExtStream,
            _ => return None,
        })
    }
}

/// Commands whose payloads never receive the 15-byte version-marker block.
const NO_MARKER_CMDS: &[CommandType] = &[
    CommandType::Udp,
    CommandType::UdpNew,
    CommandType::BroadcastLpv34,
    CommandType::ReqDevInfo,
    CommandType::DpQuery,
    CommandType::DpQueryNew,
    CommandType::DpRefresh,
    CommandType::HeartBeat,
    CommandType::SessKeyNegStart,
    CommandType::SessKeyNegResp,
    CommandType::SessKeyNegFinish,
    CommandType::LanExtStream,
];

/// One decoded, verified application-level message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number. Monotonic on send, informational on receive.
    pub seqno: u32,
    /// Raw command code from the header.
    pub cmd: u32,
    /// Return code carried by some device responses.
    pub retcode: Option<u32>,
    /// Decrypted payload bytes (JSON for most commands, raw key material for
    /// negotiation responses).
    pub payload: Vec<u8>,
    /// Prefix magic the frame arrived with.
    pub prefix: u32,
}

impl Frame {
    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_wire(self.cmd)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.cmd == CommandType::HeartBeat as u32
    }
}

/// Outcome of a single decode attempt against a byte buffer.
///
/// `consumed` is the number of buffer bytes the caller must discard. On
/// `NeedMoreBytes` nothing may be consumed.
#[derive(Debug)]
pub enum DecodeResult {
    /// The buffer does not yet hold a complete frame.
    NeedMoreBytes,
    /// A verified frame was decoded.
    Frame { frame: Frame, consumed: usize },
    /// A DP_QUERY-class reply whose body is the "data unvalid" literal:
    /// the device does not support that query command. Not an error; the
    /// caller should retry with a different command.
    DpQueryUnsupported { seqno: u32, consumed: usize },
    /// The frame was malformed or failed integrity verification and has been
    /// dropped. Never exposes payload bytes.
    Invalid { reason: String, consumed: usize },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode one outbound frame.
///
/// `key` is the active cipher key: the negotiated session key once the
/// handshake has completed, the device's local key before that (and always,
/// for v3.1/v3.3).
pub fn encode(
    cmd: CommandType,
    payload: &[u8],
    version: Version,
    key: &[u8],
    seqno: u32,
) -> Result<Vec<u8>> {
    let cipher = Cipher::new(key)?;
    let marked = version.val() >= 3.3 && !NO_MARKER_CMDS.contains(&cmd);

    match version {
        Version::V3_1 => {
            let body = if matches!(cmd, CommandType::Control | CommandType::ControlNew) {
                sign_v31(&cipher, payload, key)?
            } else {
                payload.to_vec()
            };
            assemble_55aa(seqno, cmd as u32, &body, None)
        }
        Version::V3_3 => {
            let ciphertext = cipher.ecb_encrypt(payload, true)?;
            let body = if marked {
                prepend_marker(version, &ciphertext)
            } else {
                ciphertext
            };
            assemble_55aa(seqno, cmd as u32, &body, None)
        }
        Version::V3_4 => {
            let plain = if marked {
                prepend_marker(version, payload)
            } else {
                payload.to_vec()
            };
            let ciphertext = cipher.ecb_encrypt(&plain, true)?;
            assemble_55aa(seqno, cmd as u32, &ciphertext, Some(key))
        }
        Version::V3_5 => {
            let plain = if marked {
                prepend_marker(version, payload)
            } else {
                payload.to_vec()
            };
            assemble_6699(&cipher, seqno, cmd as u32, &plain, None)
        }
    }
}

/// Legacy v3.1 signing: `"3.1" ‖ md5hex("data=" ‖ b64 ‖ "||lpv=3.1||" ‖ key)[8..24] ‖ b64`.
/// Must stay bit-compatible with old firmware.
fn sign_v31(cipher: &Cipher, payload: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    use base64::{Engine as _, engine::general_purpose};

    let ciphertext = cipher.ecb_encrypt(payload, true)?;
    let b64 = general_purpose::STANDARD.encode(&ciphertext);

    let mut to_hash = Vec::new();
    to_hash.extend_from_slice(b"data=");
    to_hash.extend_from_slice(b64.as_bytes());
    to_hash.extend_from_slice(b"||lpv=3.1||");
    to_hash.extend_from_slice(key);
    let digest = hex::encode(crypto::md5(&to_hash));

    let mut body = Vec::with_capacity(3 + 16 + b64.len());
    body.extend_from_slice(b"3.1");
    body.extend_from_slice(&digest.as_bytes()[8..24]);
    body.extend_from_slice(b64.as_bytes());
    Ok(body)
}

/// Version marker block: 3 ASCII bytes padded with zeros to 15 bytes.
fn prepend_marker(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(15 + payload.len());
    out.extend_from_slice(version.marker());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(payload);
    out
}

/// 55AA layout: header ‖ body ‖ (HMAC-SHA256 | CRC32) ‖ suffix.
/// The declared length covers body plus trailer plus suffix.
fn assemble_55aa(seqno: u32, cmd: u32, body: &[u8], hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let trailer_len: u32 = if hmac_key.is_some() { 32 + 4 } else { 4 + 4 };
    let declared = body.len() as u32 + trailer_len;

    let mut data = Vec::with_capacity(HEADER_LEN_55AA + declared as usize);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(seqno)?;
    data.write_u32::<BigEndian>(cmd)?;
    data.write_u32::<BigEndian>(declared)?;
    data.extend_from_slice(body);

    if let Some(key) = hmac_key {
        let mac = crypto::hmac_sha256(key, &data)?;
        data.extend_from_slice(&mac);
    } else {
        let crc = crypto::crc32(&data);
        data.write_u32::<BigEndian>(crc)?;
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;
    Ok(data)
}

/// 6699 layout: header ‖ nonce ‖ ciphertext ‖ tag ‖ suffix, with the header
/// bytes after the prefix (14 bytes) as GCM additional authenticated data.
fn assemble_6699(
    cipher: &Cipher,
    seqno: u32,
    cmd: u32,
    plain: &[u8],
    retcode: Option<u32>,
) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(4 + plain.len());
    if let Some(rc) = retcode {
        raw.write_u32::<BigEndian>(rc)?;
    }
    raw.extend_from_slice(plain);

    let declared = (GCM_NONCE_LEN + raw.len() + GCM_TAG_LEN) as u32;
    let mut header = Vec::with_capacity(HEADER_LEN_6699);
    header.write_u32::<BigEndian>(PREFIX_6699)?;
    header.write_u16::<BigEndian>(0)?; // reserved
    header.write_u32::<BigEndian>(seqno)?;
    header.write_u32::<BigEndian>(cmd)?;
    header.write_u32::<BigEndian>(declared)?;

    let sealed = cipher.gcm_encrypt(&raw, &header[4..], None)?;

    let mut data = Vec::with_capacity(HEADER_LEN_6699 + sealed.len() + 4);
    data.extend_from_slice(&header);
    data.extend_from_slice(&sealed);
    data.write_u32::<BigEndian>(SUFFIX_6699)?;
    Ok(data)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one frame from the front of `buf`.
///
/// Integrity is verified before any payload byte is interpreted or returned.
/// `version` selects the 55AA trailer scheme and payload cipher; 6699 frames
/// are recognized by their magic regardless of `version`.
pub fn decode(buf: &[u8], version: Version, key: &[u8]) -> DecodeResult {
    if buf.len() < MIN_FRAME_LEN {
        return DecodeResult::NeedMoreBytes;
    }

    match BigEndian::read_u32(&buf[..4]) {
        PREFIX_55AA => decode_55aa(buf, version, key),
        PREFIX_6699 => decode_6699(buf, version, key),
        _ => DecodeResult::Invalid {
            reason: "bad prefix magic".into(),
            consumed: 1,
        },
    }
}

fn decode_55aa(buf: &[u8], version: Version, key: &[u8]) -> DecodeResult {
    let seqno = BigEndian::read_u32(&buf[4..8]);
    let cmd = BigEndian::read_u32(&buf[8..12]);
    let declared = BigEndian::read_u32(&buf[12..16]);

    if declared > MAX_PAYLOAD_LEN {
        return DecodeResult::Invalid {
            reason: format!("declared length {} exceeds limit", declared),
            consumed: 4,
        };
    }
    let trailer_len = if version.uses_hmac() { 32 + 4 } else { 4 + 4 };
    if (declared as usize) < trailer_len {
        return DecodeResult::Invalid {
            reason: "declared length shorter than trailer".into(),
            consumed: 4,
        };
    }

    let total = HEADER_LEN_55AA + declared as usize;
    if buf.len() < total {
        return DecodeResult::NeedMoreBytes;
    }

    if BigEndian::read_u32(&buf[total - 4..total]) != SUFFIX_55AA {
        return DecodeResult::Invalid {
            reason: "bad suffix magic".into(),
            consumed: 4,
        };
    }

    // Verify the trailer before touching the payload region.
    let region_end = total - trailer_len;
    let signed = &buf[..region_end];
    if version.uses_hmac() {
        let expected = &buf[region_end..region_end + 32];
        if crypto::hmac_sha256_verify(key, signed, expected).is_err() {
            return DecodeResult::Invalid {
                reason: "HMAC mismatch".into(),
                consumed: total,
            };
        }
    } else {
        let received = BigEndian::read_u32(&buf[region_end..region_end + 4]);
        if crypto::crc32(signed) != received {
            return DecodeResult::Invalid {
                reason: "CRC mismatch".into(),
                consumed: total,
            };
        }
    }

    let region = &buf[HEADER_LEN_55AA..region_end];
    let (retcode, offset) = split_retcode(version, region);
    let body = &region[offset..];

    let payload = match decrypt_55aa_payload(version, key, body) {
        Ok(p) => p,
        Err(e) => {
            return DecodeResult::Invalid {
                reason: e.to_string(),
                consumed: total,
            };
        }
    };

    finish_frame(seqno, cmd, retcode, payload, PREFIX_55AA, total)
}

// Framing and cipher selection are fully determined by the 6699 magic, so
// the caller's version hint is not consulted here.
fn decode_6699(buf: &[u8], _version: Version, key: &[u8]) -> DecodeResult {
    if buf.len() < HEADER_LEN_6699 {
        return DecodeResult::NeedMoreBytes;
    }
    let seqno = BigEndian::read_u32(&buf[6..10]);
    let cmd = BigEndian::read_u32(&buf[10..14]);
    let declared = BigEndian::read_u32(&buf[14..18]);

    if declared > MAX_PAYLOAD_LEN {
        return DecodeResult::Invalid {
            reason: format!("declared length {} exceeds limit", declared),
            consumed: 4,
        };
    }
    if (declared as usize) < GCM_NONCE_LEN + GCM_TAG_LEN {
        return DecodeResult::Invalid {
            reason: "declared length shorter than nonce+tag".into(),
            consumed: 4,
        };
    }

    let total = HEADER_LEN_6699 + declared as usize + 4;
    if buf.len() < total {
        return DecodeResult::NeedMoreBytes;
    }

    if BigEndian::read_u32(&buf[total - 4..total]) != SUFFIX_6699 {
        return DecodeResult::Invalid {
            reason: "bad suffix magic".into(),
            consumed: 4,
        };
    }

    let cipher = match Cipher::new(key) {
        Ok(c) => c,
        Err(e) => {
            return DecodeResult::Invalid {
                reason: e.to_string(),
                consumed: total,
            };
        }
    };

    let sealed = &buf[HEADER_LEN_6699..total - 4];
    let nonce = &sealed[..GCM_NONCE_LEN];
    let aad = &buf[4..HEADER_LEN_6699];
    // Tag verification and decryption are one operation; failure exposes nothing.
    let plain = match cipher.gcm_decrypt(nonce, &sealed[GCM_NONCE_LEN..], aad) {
        Ok(p) => p,
        Err(e) => {
            return DecodeResult::Invalid {
                reason: e.to_string(),
                consumed: total,
            };
        }
    };

    let (retcode, offset) = split_retcode(Version::V3_5, &plain);
    let mut payload = plain[offset..].to_vec();
    if has_marker(&payload) {
        payload.drain(..15);
    }

    finish_frame(seqno, cmd, retcode, payload, PREFIX_6699, total)
}

fn finish_frame(
    seqno: u32,
    cmd: u32,
    retcode: Option<u32>,
    payload: Vec<u8>,
    prefix: u32,
    consumed: usize,
) -> DecodeResult {
    let is_dp_query =
        cmd == CommandType::DpQuery as u32 || cmd == CommandType::DpQueryNew as u32;
    if is_dp_query
        && payload
            .windows(DATA_UNVALID.len())
            .any(|w| w == DATA_UNVALID)
    {
        return DecodeResult::DpQueryUnsupported { seqno, consumed };
    }

    DecodeResult::Frame {
        frame: Frame {
            seqno,
            cmd,
            retcode,
            payload,
            prefix,
        },
        consumed,
    }
}

/// Decide whether the verified payload region starts with a 4-byte return
/// code. Device responses are inconsistent across versions, so this is a
/// cascade of structural checks rather than a single flag:
/// encrypted regions (v3.3/v3.4) are block-aligned, so a region of
/// `4 mod 16` bytes must carry a leading retcode; marked or JSON regions
/// never do.
fn split_retcode(version: Version, region: &[u8]) -> (Option<u32>, usize) {
    if region.len() < 4 || region[0] == b'{' {
        return (None, 0);
    }
    if region.starts_with(version.marker()) {
        return (None, 0);
    }
    if region.len() >= 7 && region[4..7] == version.marker()[..] {
        return (Some(BigEndian::read_u32(&region[..4])), 4);
    }
    if matches!(version, Version::V3_3 | Version::V3_4) {
        return match region.len() % 16 {
            0 => (None, 0),
            4 => (Some(BigEndian::read_u32(&region[..4])), 4),
            _ => (None, 0),
        };
    }
    // v3.1 plaintext and v3.5 decrypted bodies: a zero first byte with JSON
    // following is a retcode, anything else is payload.
    if region[0] == 0 && (region.len() == 4 || region[4] == b'{' || region[4] == b'3') {
        return (Some(BigEndian::read_u32(&region[..4])), 4);
    }
    (None, 0)
}

fn has_marker(payload: &[u8]) -> bool {
    payload.len() >= 15
        && payload[0] == b'3'
        && payload[1] == b'.'
        && payload[2].is_ascii_digit()
}

/// Inverse of the encode-side payload transforms for the 55AA family.
fn decrypt_55aa_payload(version: Version, key: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let cipher = Cipher::new(key)?;

    match version {
        Version::V3_1 => {
            if body.starts_with(b"3.1") && body.len() > 19 {
                use base64::{Engine as _, engine::general_purpose};
                // "3.1" + 16 signature hex chars, then base64 ciphertext.
                let ciphertext = general_purpose::STANDARD
                    .decode(&body[19..])
                    .map_err(|e| TuyaError::Framing(format!("bad base64: {}", e)))?;
                cipher.ecb_decrypt(&ciphertext, true)
            } else {
                Ok(body.to_vec())
            }
        }
        Version::V3_3 => {
            let body = if has_marker(body) { &body[15..] } else { body };
            if body.is_empty() || body[0] == b'{' {
                return Ok(body.to_vec());
            }
            match cipher.ecb_decrypt(body, true) {
                Ok(plain) => Ok(plain),
                // Some devices answer command errors in plaintext.
                Err(_) if body.windows(DATA_UNVALID.len()).any(|w| w == DATA_UNVALID) => {
                    Ok(body.to_vec())
                }
                Err(e) => Err(e),
            }
        }
        Version::V3_4 => {
            let mut plain = cipher.ecb_decrypt(body, true)?;
            if has_marker(&plain) {
                plain.drain(..15);
            }
            Ok(plain)
        }
        // 6699 frames never reach this path.
        Version::V3_5 => Ok(body.to_vec()),
    }
}

// ---------------------------------------------------------------------------
// Stream reassembly
// ---------------------------------------------------------------------------

/// Event produced once a complete frame (valid or not) has been consumed
/// from the stream buffer.
#[derive(Debug)]
pub enum FrameEvent {
    Frame(Frame),
    DpQueryUnsupported { seqno: u32 },
    /// A frame-sized region was dropped (integrity or framing failure).
    Corrupt(String),
}

/// Length-prefixed reassembly buffer over an arbitrary-chunked byte stream.
///
/// Append bytes as they arrive, then drain events until `next_event` returns
/// `None` (meaning: a partial frame is pending). Garbage between frames is
/// skipped by scanning forward to the next prefix magic.
pub struct FrameBuffer {
    version: Version,
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            buf: Vec::with_capacity(1024),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to decode the next frame. Returns `None` when more bytes are
    /// needed; no bytes are consumed in that case.
    pub fn next_event(&mut self, key: &[u8]) -> Option<FrameEvent> {
        self.align();
        match decode(&self.buf, self.version, key) {
            DecodeResult::NeedMoreBytes => None,
            DecodeResult::Frame { frame, consumed } => {
                self.buf.drain(..consumed);
                Some(FrameEvent::Frame(frame))
            }
            DecodeResult::DpQueryUnsupported { seqno, consumed } => {
                self.buf.drain(..consumed);
                Some(FrameEvent::DpQueryUnsupported { seqno })
            }
            DecodeResult::Invalid { reason, consumed } => {
                self.buf.drain(..consumed.max(1));
                Some(FrameEvent::Corrupt(reason))
            }
        }
    }

    /// Drop bytes preceding the next prefix magic. Keeps up to three trailing
    /// bytes that could be the start of a magic split across reads.
    fn align(&mut self) {
        if self.buf.len() < 4 {
            return;
        }
        let pos = self
            .buf
            .windows(4)
            .position(|w| matches!(BigEndian::read_u32(w), PREFIX_55AA | PREFIX_6699));
        match pos {
            Some(0) => {}
            Some(i) => {
                self.buf.drain(..i);
            }
            None => {
                let keep_from = self.buf.len() - 3;
                self.buf.drain(..keep_from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"sixteen byte key";
    const PAYLOAD: &[u8] = br#"{"dps":{"1":true},"t":1700000000}"#;

    fn decode_one(encoded: &[u8], version: Version) -> Frame {
        match decode(encoded, version, KEY) {
            DecodeResult::Frame { frame, consumed } => {
                assert_eq!(consumed, encoded.len());
                frame
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn roundtrip_v31_control() {
        let encoded = encode(CommandType::Control, PAYLOAD, Version::V3_1, KEY, 7).unwrap();
        let frame = decode_one(&encoded, Version::V3_1);
        assert_eq!(frame.seqno, 7);
        assert_eq!(frame.cmd, CommandType::Control as u32);
        assert_eq!(frame.payload, PAYLOAD);
    }

    #[test]
    fn v31_signature_layout_is_stable() {
        let encoded = encode(CommandType::Control, PAYLOAD, Version::V3_1, KEY, 0).unwrap();
        // Body region starts after the 16-byte header.
        let body = &encoded[16..encoded.len() - 8];
        assert_eq!(&body[..3], b"3.1");
        // 16 hex chars of the truncated MD5 signature.
        assert!(body[3..19].iter().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn roundtrip_v33_marked_and_unmarked() {
        for (cmd, expect_marker) in [
            (CommandType::Control, true),
            (CommandType::HeartBeat, false),
        ] {
            let encoded = encode(cmd, PAYLOAD, Version::V3_3, KEY, 3).unwrap();
            if expect_marker {
                assert_eq!(&encoded[16..19], b"3.3");
            }
            let frame = decode_one(&encoded, Version::V3_3);
            assert_eq!(frame.cmd, cmd as u32);
            assert_eq!(frame.payload, PAYLOAD);
            assert_eq!(frame.retcode, None);
        }
    }

    #[test]
    fn roundtrip_v34_hmac() {
        let encoded = encode(CommandType::ControlNew, PAYLOAD, Version::V3_4, KEY, 11).unwrap();
        let frame = decode_one(&encoded, Version::V3_4);
        assert_eq!(frame.seqno, 11);
        assert_eq!(frame.payload, PAYLOAD);
    }

    #[test]
    fn roundtrip_v34_raw_negotiation_payload() {
        // Negotiation payloads are raw bytes, not JSON, and carry no marker.
        let nonce = [0xA7u8; 16];
        let encoded =
            encode(CommandType::SessKeyNegStart, &nonce, Version::V3_4, KEY, 1).unwrap();
        let frame = decode_one(&encoded, Version::V3_4);
        assert_eq!(frame.payload, nonce);
        assert_eq!(frame.retcode, None);
    }

    #[test]
    fn roundtrip_v35_gcm() {
        let encoded = encode(CommandType::ControlNew, PAYLOAD, Version::V3_5, KEY, 99).unwrap();
        assert_eq!(BigEndian::read_u32(&encoded[..4]), PREFIX_6699);
        let frame = decode_one(&encoded, Version::V3_5);
        assert_eq!(frame.seqno, 99);
        assert_eq!(frame.prefix, PREFIX_6699);
        assert_eq!(frame.payload, PAYLOAD);
    }

    #[test]
    fn v35_frame_detected_by_magic_even_with_wrong_version_hint() {
        let encoded = encode(CommandType::Status, PAYLOAD, Version::V3_5, KEY, 2).unwrap();
        // The decoder must dispatch on the 6699 magic, not the caller's hint.
        let frame = decode_one(&encoded, Version::V3_3);
        assert_eq!(frame.payload, PAYLOAD);
    }

    #[test]
    fn tampered_crc_rejected() {
        let mut encoded = encode(CommandType::Control, PAYLOAD, Version::V3_3, KEY, 1).unwrap();
        let crc_pos = encoded.len() - 8;
        encoded[crc_pos] ^= 0x01;
        match decode(&encoded, Version::V3_3, KEY) {
            DecodeResult::Invalid { reason, consumed } => {
                assert!(reason.contains("CRC"));
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn tampered_hmac_rejected() {
        let mut encoded = encode(CommandType::Control, PAYLOAD, Version::V3_4, KEY, 1).unwrap();
        let mac_pos = encoded.len() - 36;
        encoded[mac_pos] ^= 0x80;
        assert!(matches!(
            decode(&encoded, Version::V3_4, KEY),
            DecodeResult::Invalid { .. }
        ));
    }

    #[test]
    fn tampered_gcm_tag_rejected() {
        let mut encoded = encode(CommandType::Control, PAYLOAD, Version::V3_5, KEY, 1).unwrap();
        let tag_pos = encoded.len() - 5; // inside the tag, before the suffix
        encoded[tag_pos] ^= 0x01;
        assert!(matches!(
            decode(&encoded, Version::V3_5, KEY),
            DecodeResult::Invalid { .. }
        ));
    }

    #[test]
    fn every_strict_prefix_needs_more_bytes() {
        for version in [Version::V3_3, Version::V3_4, Version::V3_5] {
            let encoded = encode(CommandType::Status, PAYLOAD, version, KEY, 5).unwrap();
            let mut fb = FrameBuffer::new(version);
            for (i, byte) in encoded.iter().enumerate() {
                fb.extend(std::slice::from_ref(byte));
                if i + 1 < encoded.len() {
                    assert!(
                        fb.next_event(KEY).is_none(),
                        "version {} produced an event at prefix length {}",
                        version,
                        i + 1
                    );
                }
            }
            match fb.next_event(KEY) {
                Some(FrameEvent::Frame(frame)) => assert_eq!(frame.payload, PAYLOAD),
                other => panic!("expected frame, got {:?}", other),
            }
            assert!(fb.is_empty(), "bytes over-consumed or left behind");
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = encode(CommandType::HeartBeat, br#"{"dps":""}"#, Version::V3_3, KEY, 1).unwrap();
        let b = encode(CommandType::Status, PAYLOAD, Version::V3_3, KEY, 2).unwrap();
        let mut fb = FrameBuffer::new(Version::V3_3);
        fb.extend(&a);
        fb.extend(&b);
        let first = fb.next_event(KEY).unwrap();
        let second = fb.next_event(KEY).unwrap();
        assert!(matches!(first, FrameEvent::Frame(ref f) if f.seqno == 1));
        assert!(matches!(second, FrameEvent::Frame(ref f) if f.seqno == 2));
        assert!(fb.next_event(KEY).is_none());
        assert!(fb.is_empty());
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let encoded = encode(CommandType::Status, PAYLOAD, Version::V3_3, KEY, 4).unwrap();
        let mut fb = FrameBuffer::new(Version::V3_3);
        fb.extend(b"\xde\xad\xbe\xef junk");
        fb.extend(&encoded);
        match fb.next_event(KEY) {
            Some(FrameEvent::Frame(frame)) => assert_eq!(frame.payload, PAYLOAD),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn dp_query_unsupported_is_a_distinct_result() {
        let body = b"json obj data unvalid";
        let encoded = encode(CommandType::DpQuery, body, Version::V3_3, KEY, 9).unwrap();
        match decode(&encoded, Version::V3_3, KEY) {
            DecodeResult::DpQueryUnsupported { seqno, .. } => assert_eq!(seqno, 9),
            other => panic!("expected DpQueryUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn retcode_extracted_from_device_reply() {
        // Simulate a v3.3 device reply: retcode 0 followed by ciphertext.
        let cipher = Cipher::new(KEY).unwrap();
        let ct = cipher.ecb_encrypt(PAYLOAD, true).unwrap();
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&ct);
        let raw = assemble_55aa(21, CommandType::Status as u32, &body, None).unwrap();
        let frame = decode_one(&raw, Version::V3_3);
        assert_eq!(frame.retcode, Some(0));
        assert_eq!(frame.payload, PAYLOAD);
    }

    #[test]
    fn command_codes_map_both_ways() {
        for cmd in [
            CommandType::Udp,
            CommandType::SessKeyNegStart,
            CommandType::Control,
            CommandType::HeartBeat,
            CommandType::DpQuery,
            CommandType::BroadcastLpv34,
            CommandType::ReqDevInfo,
            CommandType::LanExtStream,
        ] {
            assert_eq!(CommandType::from_wire(cmd as u32), Some(cmd));
        }
        assert_eq!(CommandType::from_wire(0xdead), None);
    }

    #[test]
    fn version_parsing() {
        assert_eq!("3.4".parse::<Version>().unwrap(), Version::V3_4);
        assert!("9.9".parse::<Version>().is_err());
        assert!(Version::V3_4.uses_hmac());
        assert!(Version::V3_5.uses_gcm());
        assert!(!Version::V3_3.negotiates_session_key());
    }
}
