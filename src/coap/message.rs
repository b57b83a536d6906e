//! CoAP message framing (RFC 7252 subset).
//!
//! Wire layout:
//! ```text
//!  0                   1                   2                   3
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! |   Token (0-8 bytes) ...
//! |   Options (delta encoded) ...
//! |1 1 1 1 1 1 1 1|    Payload ...
//! ```

use std::fmt;
use strum::Display;
use thiserror::Error as ThisError;

pub const VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LEN: usize = 8;

// Option numbers
pub const OPTION_OBSERVE: u16 = 6;
pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;
pub const OPTION_MAX_AGE: u16 = 14;

// Content formats
pub const FORMAT_TEXT_PLAIN: u16 = 0;
pub const FORMAT_LINK: u16 = 40;
pub const FORMAT_JSON: u16 = 50;

/// Framing failures.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram shorter than the 4-byte header")]
    ShortHeader,

    #[error("unsupported CoAP version {0}")]
    BadVersion(u8),

    #[error("token length {0} exceeds 8")]
    TokenLength(u8),

    #[error("reserved option nibble 15")]
    ReservedNibble,

    #[error("datagram truncated")]
    Truncated,

    #[error("payload marker followed by empty payload")]
    EmptyPayload,

    #[error("option number overflow")]
    OptionOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MessageType {
    #[strum(serialize = "CON")]
    Confirmable,
    #[strum(serialize = "NON")]
    NonConfirmable,
    #[strum(serialize = "ACK")]
    Acknowledgement,
    #[strum(serialize = "RST")]
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method or response code, `class.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);
    pub const CHANGED: Code = Code::response(2, 4);
    pub const CONTENT: Code = Code::response(2, 5);
    pub const BAD_REQUEST: Code = Code::response(4, 0);
    pub const NOT_FOUND: Code = Code::response(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::response(4, 5);
    pub const INTERNAL_SERVER_ERROR: Code = Code::response(5, 0);

    pub const fn response(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    pub fn is_error(self) -> bool {
        matches!(self.class(), 4 | 5)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Kept sorted by option number; repeated options keep insertion order.
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(mtype: MessageType, code: Code, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty ACK or RST for `message_id`.
    pub fn empty(mtype: MessageType, message_id: u16) -> Self {
        Self::new(mtype, Code::EMPTY, message_id, Vec::new())
    }

    pub fn request(
        mtype: MessageType,
        code: Code,
        message_id: u16,
        token: Vec<u8>,
        path: &str,
    ) -> Self {
        let mut message = Self::new(mtype, code, message_id, token);
        message.set_uri_path(path);
        message
    }

    pub fn is_empty(&self) -> bool {
        self.code == Code::EMPTY
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, CoapOption { number, value });
    }

    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn set_uint_option(&mut self, number: u16, value: u32) {
        self.remove_option(number);
        self.add_option(number, encode_uint(value));
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.option(number).map(decode_uint)
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_option(OPTION_URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OPTION_URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Uri-Path options joined back into `/a/b`.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for option in self.options.iter().filter(|o| o.number == OPTION_URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(&option.value));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint_option(OPTION_OBSERVE)
    }

    /// Observe values are 24 bits on the wire.
    pub fn set_observe(&mut self, value: u32) {
        self.set_uint_option(OPTION_OBSERVE, value & 0x00FF_FFFF);
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(OPTION_CONTENT_FORMAT).map(|v| v as u16)
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_uint_option(OPTION_CONTENT_FORMAT, format as u32);
    }

    pub fn max_age(&self) -> Option<u32> {
        self.uint_option(OPTION_MAX_AGE)
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_uint_option(OPTION_MAX_AGE, seconds);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 32);
        let tkl = self.token.len().min(MAX_TOKEN_LEN);
        out.push((VERSION << 6) | (self.mtype.bits() << 4) | tkl as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..tkl]);

        let mut previous = 0u16;
        for option in &self.options {
            let delta = option.number - previous;
            previous = option.number;
            let (delta_nibble, delta_ext) = split_extended(delta as usize);
            let (len_nibble, len_ext) = split_extended(option.value.len());
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&option.value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
        if data.len() < 4 {
            return Err(CodecError::ShortHeader);
        }
        let version = data[0] >> 6;
        if version != VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let mtype = MessageType::from_bits(data[0] >> 4);
        let tkl = data[0] & 0x0F;
        if tkl as usize > MAX_TOKEN_LEN {
            return Err(CodecError::TokenLength(tkl));
        }
        let code = Code(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = 4;
        let token = data
            .get(pos..pos + tkl as usize)
            .ok_or(CodecError::Truncated)?
            .to_vec();
        pos += tkl as usize;

        let mut message = Message::new(mtype, code, message_id, token);
        let mut number = 0u16;
        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(CodecError::EmptyPayload);
                }
                message.payload = data[pos..].to_vec();
                break;
            }

            let delta = read_extended(byte >> 4, data, &mut pos)?;
            let len = read_extended(byte & 0x0F, data, &mut pos)?;
            number = u16::try_from(number as usize + delta)
                .map_err(|_| CodecError::OptionOverflow)?;
            let value = data.get(pos..pos + len).ok_or(CodecError::Truncated)?;
            pos += len;
            message.options.push(CoapOption {
                number,
                value: value.to_vec(),
            });
        }
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mid={} token={:02x?}",
            self.mtype, self.code, self.message_id, self.token
        )?;
        if self.code.is_request() {
            write!(f, " {}", self.uri_path())?;
        }
        if let Some(seq) = self.observe() {
            write!(f, " obs={}", seq)?;
        }
        Ok(())
    }
}

/// Minimal big-endian encoding; zero is the empty value.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

fn split_extended(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn read_extended(nibble: u8, data: &[u8], pos: &mut usize) -> Result<usize, CodecError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let byte = *data.get(*pos).ok_or(CodecError::Truncated)?;
            *pos += 1;
            Ok(byte as usize + 13)
        }
        14 => {
            let bytes = data.get(*pos..*pos + 2).ok_or(CodecError::Truncated)?;
            *pos += 2;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as usize + 269)
        }
        _ => Err(CodecError::ReservedNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_request_bytes() {
        let message = Message::request(
            MessageType::Confirmable,
            Code::GET,
            0x1234,
            vec![0xAB],
            "/ChlorineResource",
        );
        let mut expected = vec![0x41, 0x01, 0x12, 0x34, 0xAB, 0xBD, 0x03];
        expected.extend_from_slice(b"ChlorineResource");
        assert_eq!(message.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), message);
    }

    #[test]
    fn test_response_options_and_payload() {
        let mut message = Message::new(
            MessageType::Acknowledgement,
            Code::CONTENT,
            7,
            vec![1, 2, 3, 4],
        );
        message.set_max_age(10);
        message.set_content_format(FORMAT_JSON);
        message.set_observe(0x0100_0005);
        message.payload = br#"{"temperature":17.0}"#.to_vec();

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.code, Code::CONTENT);
        assert_eq!(decoded.observe(), Some(5));
        assert_eq!(decoded.max_age(), Some(10));
        assert_eq!(decoded.content_format(), Some(FORMAT_JSON));
        assert_eq!(decoded.payload, message.payload);
        let numbers: Vec<u16> = decoded.options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![OPTION_OBSERVE, OPTION_CONTENT_FORMAT, OPTION_MAX_AGE]);
    }

    #[test]
    fn test_extended_option_delta() {
        let mut message = Message::new(MessageType::NonConfirmable, Code::GET, 1, Vec::new());
        message.add_option(300, vec![0; 20]);
        let bytes = message.encode();
        assert_eq!(bytes[4], 0xED);
        assert_eq!(Message::decode(&bytes).unwrap().option(300), Some(&[0u8; 20][..]));
    }

    #[test]
    fn test_uri_path_segments() {
        let message = Message::request(
            MessageType::Confirmable,
            Code::GET,
            1,
            Vec::new(),
            "/.well-known/core",
        );
        assert_eq!(message.options.len(), 2);
        assert_eq!(message.uri_path(), "/.well-known/core");
        let root = Message::new(MessageType::Confirmable, Code::GET, 1, Vec::new());
        assert_eq!(root.uri_path(), "/");
    }

    #[test]
    fn test_uint_encoding() {
        assert!(encode_uint(0).is_empty());
        assert_eq!(encode_uint(10), vec![10]);
        assert_eq!(encode_uint(256), vec![1, 0]);
        assert_eq!(decode_uint(&[]), 0);
        assert_eq!(decode_uint(&[1, 0]), 256);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::METHOD_NOT_ALLOWED.to_string(), "4.05");
        assert_eq!(Code::GET.to_string(), "0.01");
        assert!(Code::POST.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(Code::INTERNAL_SERVER_ERROR.is_error());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Message::decode(&[0x40, 0x01]), Err(CodecError::ShortHeader));
        assert_eq!(
            Message::decode(&[0x80, 0x01, 0, 0]),
            Err(CodecError::BadVersion(2))
        );
        assert_eq!(
            Message::decode(&[0x49, 0x01, 0, 0]),
            Err(CodecError::TokenLength(9))
        );
        assert_eq!(
            Message::decode(&[0x42, 0x01, 0, 0, 0xAA]),
            Err(CodecError::Truncated)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 0, 0xF1, 0x00]),
            Err(CodecError::ReservedNibble)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 0, 0xB3, b'a']),
            Err(CodecError::Truncated)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 0, 0xFF]),
            Err(CodecError::EmptyPayload)
        );
    }
}
