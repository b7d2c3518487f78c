//! Minimal BER tag-length-value support for the fixed message alphabet
//! spoken between Primary and Secondary. Definite lengths only; the
//! decoder reports `MoreNeeded` so callers can stream from a socket.

use std::fmt::{self, Display, Formatter};


pub const TAG_INT:      u8 = 0x02;
pub const TAG_OCTETS:   u8 = 0x04;
pub const TAG_UTF8:     u8 = 0x0c;
pub const TAG_SEQUENCE: u8 = 0x30;

/// A context-specific constructed tag, as used for the top-level message
/// choice and nested choice members.
pub fn context(num: u8) -> u8 {
    0xa0 | num
}

/// A context-specific primitive tag.
pub fn context_primitive(num: u8) -> u8 {
    0x80 | num
}

/// The tag number of a context-specific tag.
pub fn tag_number(tag: u8) -> u8 {
    tag & 0x1f
}

pub fn is_context(tag: u8) -> bool {
    tag & 0xc0 == 0x80
}


#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends before the value does; read more bytes and retry.
    MoreNeeded,
    /// The bytes cannot be a value of the expected shape.
    Invalid(String),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            DecodeError::MoreNeeded => write!(f, "incomplete BER value"),
            DecodeError::Invalid(ref err) => write!(f, "invalid BER value: {}", err),
        }
    }
}


pub fn write_tlv(buf: &mut Vec<u8>, tag: u8, content: &[u8]) {
    buf.push(tag);
    write_len(buf, content.len());
    buf.extend_from_slice(content);
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        let bytes = (len as u64).to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).expect("nonzero length");
        buf.push(0x80 | (bytes.len() - start) as u8);
        buf.extend_from_slice(&bytes[start..]);
    }
}

pub fn write_utf8(buf: &mut Vec<u8>, text: &str) {
    write_tlv(buf, TAG_UTF8, text.as_bytes());
}

pub fn write_octets(buf: &mut Vec<u8>, data: &[u8]) {
    write_tlv(buf, TAG_OCTETS, data);
}

/// Write an INTEGER in minimal two's complement form.
pub fn write_int(buf: &mut Vec<u8>, val: i64) {
    let bytes = val.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                     || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if redundant { start += 1 } else { break }
    }
    write_tlv(buf, TAG_INT, &bytes[start..]);
}


/// A cursor over BER values in a byte buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf: buf, pos: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read the next tag-length-value, returning the tag and its content.
    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), DecodeError> {
        let rest = &self.buf[self.pos..];
        if rest.len() < 2 {
            return Err(DecodeError::MoreNeeded);
        }
        let tag = rest[0];
        if tag & 0x1f == 0x1f {
            return Err(DecodeError::Invalid("multi-byte tags are not used".into()));
        }

        let (len, header) = match rest[1] {
            byte if byte < 0x80 => (byte as usize, 2),
            0x80 => return Err(DecodeError::Invalid("indefinite lengths are not supported".into())),
            byte => {
                let count = (byte & 0x7f) as usize;
                if count > 8 {
                    return Err(DecodeError::Invalid(format!("unreasonable length of length: {}", count)));
                }
                if rest.len() < 2 + count {
                    return Err(DecodeError::MoreNeeded);
                }
                let mut len: u64 = 0;
                for &byte in &rest[2..2 + count] {
                    len = (len << 8) | byte as u64;
                }
                if len > usize::max_value() as u64 {
                    return Err(DecodeError::Invalid("length overflows".into()));
                }
                (len as usize, 2 + count)
            }
        };

        if rest.len() < header + len {
            return Err(DecodeError::MoreNeeded);
        }
        let content = &rest[header..header + len];
        self.pos += header + len;
        Ok((tag, content))
    }

    /// Read the next value and insist on its tag.
    pub fn expect_tlv(&mut self, tag: u8) -> Result<&'a [u8], DecodeError> {
        let (found, content) = self.read_tlv()?;
        if found != tag {
            Err(DecodeError::Invalid(format!("expected tag {:#04x}, found {:#04x}", tag, found)))
        } else {
            Ok(content)
        }
    }

    pub fn read_utf8(&mut self) -> Result<String, DecodeError> {
        let content = self.expect_tlv(TAG_UTF8)?;
        String::from_utf8(content.into())
            .map_err(|err| DecodeError::Invalid(format!("UTF8String: {}", err)))
    }

    pub fn read_octets(&mut self) -> Result<Vec<u8>, DecodeError> {
        Ok(self.expect_tlv(TAG_OCTETS)?.into())
    }

    pub fn read_int(&mut self) -> Result<i64, DecodeError> {
        let content = self.expect_tlv(TAG_INT)?;
        if content.is_empty() || content.len() > 8 {
            return Err(DecodeError::Invalid(format!("INTEGER of {} bytes", content.len())));
        }
        let mut val: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
        for &byte in content {
            val = (val << 8) | byte as i64;
        }
        Ok(val)
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    fn int_round_trip(val: i64) {
        let mut buf = Vec::new();
        write_int(&mut buf, val);
        assert_eq!(Reader::new(&buf).read_int().expect("read int"), val);
    }

    #[test]
    fn integers_round_trip() {
        for &val in &[0, 1, -1, 127, 128, 255, 256, -128, -129, 21,
                      i64::max_value(), i64::min_value()] {
            int_round_trip(val);
        }
    }

    #[test]
    fn minimal_integer_encoding() {
        let mut buf = Vec::new();
        write_int(&mut buf, 0);
        assert_eq!(buf, vec![0x02, 0x01, 0x00]);

        buf.clear();
        write_int(&mut buf, 128);
        assert_eq!(buf, vec![0x02, 0x02, 0x00, 0x80]);

        buf.clear();
        write_int(&mut buf, -1);
        assert_eq!(buf, vec![0x02, 0x01, 0xff]);
    }

    #[test]
    fn long_form_lengths() {
        let data = vec![0xab; 300];
        let mut buf = Vec::new();
        write_octets(&mut buf, &data);
        assert_eq!(&buf[..4], &[0x04, 0x82, 0x01, 0x2c]);
        assert_eq!(Reader::new(&buf).read_octets().expect("read octets"), data);
    }

    #[test]
    fn truncated_values_want_more() {
        let mut buf = Vec::new();
        write_octets(&mut buf, &[1, 2, 3, 4]);
        for cut in 0..buf.len() {
            assert_eq!(Reader::new(&buf[..cut]).read_tlv().unwrap_err(), DecodeError::MoreNeeded);
        }
        assert!(Reader::new(&buf).read_tlv().is_ok());
    }

    #[test]
    fn indefinite_lengths_are_invalid() {
        match Reader::new(&[0x30, 0x80, 0x00, 0x00]).read_tlv() {
            Err(DecodeError::Invalid(_)) => (),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn tag_mismatch_is_invalid() {
        let mut buf = Vec::new();
        write_utf8(&mut buf, "hello");
        match Reader::new(&buf).read_octets() {
            Err(DecodeError::Invalid(_)) => (),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn nested_values() {
        let mut inner = Vec::new();
        write_utf8(&mut inner, "serial");
        write_int(&mut inner, 42);
        let mut outer = Vec::new();
        write_tlv(&mut outer, context(1), &inner);

        let mut reader = Reader::new(&outer);
        let content = reader.expect_tlv(context(1)).expect("outer");
        let mut fields = Reader::new(content);
        assert_eq!(fields.read_utf8().expect("utf8"), "serial");
        assert_eq!(fields.read_int().expect("int"), 42);
        assert!(fields.is_empty());
    }
}
