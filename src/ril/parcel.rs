//! Parcel encoding used by RIL frame bodies.
//!
//! Integers are little-endian. Strings are a 32-bit UTF-16 code unit
//! count (-1 encodes NULL), the code units, a 16-bit terminator and
//! zero padding up to the next 4-byte boundary. Arrays are a 32-bit
//! element count followed by the elements.

use heapless::{String, Vec};

/// Sequential reader over a parcel body.
#[derive(Clone)]
pub struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos.min(self.data.len())
    }

    pub fn get_i32(&mut self) -> Option<i32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_i32().map(|v| v as u32)
    }

    pub fn skip_i32(&mut self) -> bool {
        self.get_i32().is_some()
    }

    fn get_u16(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    /// Reads a string. The outer `None` means a malformed or oversized
    /// parcel, the inner `None` a wire-encoded NULL.
    pub fn get_string<const N: usize>(&mut self) -> Option<Option<String<N>>> {
        let len = self.get_i32()?;
        if len < 0 {
            return Some(None);
        }

        // Large enough for the longest strings seen on the wire (the
        // hex payload of a full SIM record read).
        let mut units: Vec<u16, 512> = Vec::new();
        for _ in 0..len {
            units.push(self.get_u16()?).ok()?;
        }
        self.get_u16()?; // terminator
        self.align();

        let mut out = String::new();
        for c in core::char::decode_utf16(units.iter().copied()) {
            out.push(c.ok()?).ok()?;
        }
        Some(Some(out))
    }

    pub fn skip_string(&mut self) -> bool {
        match self.get_i32() {
            Some(len) if len >= 0 => {
                let bytes = 2 * (len as usize + 1);
                if self.remaining() < bytes {
                    return false;
                }
                self.pos += bytes;
                self.align();
                true
            }
            Some(_) => true, // NULL
            None => false,
        }
    }

    /// Reads a string and splits it on spaces, the way address/DNS/
    /// gateway lists come in data call records. NULL or empty yields an
    /// empty list; excess entries beyond `M` are dropped.
    pub fn split_string<const N: usize, const M: usize>(&mut self) -> Option<Vec<String<N>, M>> {
        let s: Option<String<512>> = self.get_string()?;
        let mut out = Vec::new();
        if let Some(s) = s {
            for word in s.split(' ').filter(|w| !w.is_empty()) {
                let mut item = String::new();
                if item.push_str(word).is_err() {
                    return None;
                }
                if out.push(item).is_err() {
                    break;
                }
            }
        }
        Some(out)
    }
}

/// Builds a parcel body in a bounded buffer. Overflow is latched and
/// checked when the body is taken.
pub struct Builder<const N: usize = 1024> {
    buf: Vec<u8, N>,
    overflow: bool,
}

impl<const N: usize> Default for Builder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Builder<N> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            overflow: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.buf.extend_from_slice(bytes).is_err() {
            self.overflow = true;
        }
    }

    pub fn append_i32(&mut self, v: i32) -> &mut Self {
        self.push(&v.to_le_bytes());
        self
    }

    pub fn append_u32(&mut self, v: u32) -> &mut Self {
        self.append_i32(v as i32)
    }

    pub fn append_bool(&mut self, v: bool) -> &mut Self {
        self.append_i32(v as i32)
    }

    pub fn append_utf8(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            None => self.append_i32(-1),
            Some(s) => {
                let len = s.encode_utf16().count();
                self.append_i32(len as i32);
                for unit in s.encode_utf16() {
                    self.push(&unit.to_le_bytes());
                }
                self.push(&0u16.to_le_bytes());
                while self.buf.len() % 4 != 0 {
                    self.push(&[0]);
                }
                self
            }
        }
    }

    /// Formats an integer as its decimal string. Several requests carry
    /// numbers this way (SETUP_DATA_CALL, DEACTIVATE_DATA_CALL).
    pub fn append_int_utf8(&mut self, v: i32) -> &mut Self {
        let mut s: String<12> = String::new();
        // itoa by hand; the value range is tiny
        if core::fmt::Write::write_fmt(&mut s, format_args!("{}", v)).is_err() {
            self.overflow = true;
        }
        self.append_utf8(Some(&s))
    }

    pub fn append_i32_array(&mut self, values: &[i32]) -> &mut Self {
        self.append_i32(values.len() as i32);
        for v in values {
            self.append_i32(*v);
        }
        self
    }

    pub fn append_utf8_array(&mut self, values: &[Option<&str>]) -> &mut Self {
        self.append_i32(values.len() as i32);
        for v in values {
            self.append_utf8(*v);
        }
        self
    }

    pub fn take(self) -> Option<Vec<u8, N>> {
        if self.overflow {
            None
        } else {
            Some(self.buf)
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build<const N: usize>(f: impl FnOnce(&mut Builder<N>)) -> Vec<u8, N> {
        let mut b = Builder::new();
        f(&mut b);
        b.take().unwrap()
    }

    #[test]
    fn int32_round_trip() {
        let body = build::<64>(|b| {
            b.append_i32(-1).append_i32(0x1234_5678).append_u32(7);
        });
        let mut p = Parser::new(&body);
        assert_eq!(p.get_i32(), Some(-1));
        assert_eq!(p.get_i32(), Some(0x1234_5678));
        assert_eq!(p.get_u32(), Some(7));
        assert!(p.at_end());
    }

    #[test]
    fn string_round_trip() {
        let body = build::<128>(|b| {
            b.append_utf8(Some("rmnet0")).append_utf8(None).append_i32(5);
        });
        let mut p = Parser::new(&body);
        let s: Option<String<16>> = p.get_string().unwrap();
        assert_eq!(s.as_deref(), Some("rmnet0"));
        let s: Option<String<16>> = p.get_string().unwrap();
        assert_eq!(s, None);
        assert_eq!(p.get_i32(), Some(5));
        assert!(p.at_end());
    }

    #[test]
    fn string_padding_is_aligned() {
        // "ab" -> 4 len + 4 units incl. terminator + padding = multiple of 4
        let body = build::<64>(|b| {
            b.append_utf8(Some("ab"));
        });
        assert_eq!(body.len() % 4, 0);
        let body = build::<64>(|b| {
            b.append_utf8(Some("abc"));
        });
        assert_eq!(body.len() % 4, 0);
    }

    #[test]
    fn skip_string_consumes_padding() {
        let body = build::<128>(|b| {
            b.append_utf8(Some("x")).append_i32(42);
        });
        let mut p = Parser::new(&body);
        assert!(p.skip_string());
        assert_eq!(p.get_i32(), Some(42));
    }

    #[test]
    fn split_string_on_spaces() {
        let body = build::<128>(|b| {
            b.append_utf8(Some("10.0.0.2/24 2001:db8::2/64"));
        });
        let mut p = Parser::new(&body);
        let list: Vec<String<40>, 4> = p.split_string().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], "10.0.0.2/24");
        assert_eq!(list[1], "2001:db8::2/64");
    }

    #[test]
    fn split_string_null_is_empty() {
        let body = build::<16>(|b| {
            b.append_utf8(None);
        });
        let mut p = Parser::new(&body);
        let list: Vec<String<8>, 4> = p.split_string().unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn arrays() {
        let body = build::<128>(|b| {
            b.append_i32_array(&[1, 0]);
            b.append_utf8_array(&[Some("0000"), None]);
        });
        let mut p = Parser::new(&body);
        assert_eq!(p.get_i32(), Some(2));
        assert_eq!(p.get_i32(), Some(1));
        assert_eq!(p.get_i32(), Some(0));
        assert_eq!(p.get_i32(), Some(2));
        let s: Option<String<8>> = p.get_string().unwrap();
        assert_eq!(s.as_deref(), Some("0000"));
        let s: Option<String<8>> = p.get_string().unwrap();
        assert_eq!(s, None);
    }

    #[test]
    fn truncated_parcel_fails() {
        let mut p = Parser::new(&[1, 0]);
        assert_eq!(p.get_i32(), None);
        let body = build::<64>(|b| {
            b.append_utf8(Some("hello"));
        });
        let mut p = Parser::new(&body[..6]);
        assert!(p.get_string::<8>().is_none());
    }

    #[test]
    fn builder_overflow_is_latched() {
        let mut b: Builder<8> = Builder::new();
        b.append_i32(1).append_i32(2).append_i32(3);
        assert!(b.take().is_none());
    }
}
