//! Length-prefixed framing of the rild stream socket.
//!
//! Each frame is a 32-bit big-endian payload length followed by the
//! payload. Request payloads start with `code, serial`, response
//! payloads with `0, serial, status` and unsolicited payloads with
//! `1, code`, all little-endian.

use embedded_io_async::{Read, ReadExactError, Write};

use super::parcel::Parser;

/// Largest payload we accept from the peer. Cell info lists are the
/// biggest packets seen in practice.
pub const MAX_FRAME: usize = 4096;

const RESPONSE_TAG: i32 = 0;
const UNSOL_TAG: i32 = 1;

#[derive(Debug)]
pub enum FrameError<E> {
    Io(E),
    UnexpectedEof,
    TooLong(usize),
}

impl<E> From<ReadExactError<E>> for FrameError<E> {
    fn from(e: ReadExactError<E>) -> Self {
        match e {
            ReadExactError::UnexpectedEof => Self::UnexpectedEof,
            ReadExactError::Other(e) => Self::Io(e),
        }
    }
}

/// One decoded inbound payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Response {
        serial: u32,
        status: i32,
        data: &'a [u8],
    },
    Unsol {
        code: u32,
        data: &'a [u8],
    },
}

/// Splits an inbound payload into its header and body.
pub fn parse(payload: &[u8]) -> Option<Packet<'_>> {
    let mut p = Parser::new(payload);
    match p.get_i32()? {
        RESPONSE_TAG => {
            let serial = p.get_u32()?;
            let status = p.get_i32()?;
            Some(Packet::Response {
                serial,
                status,
                data: &payload[12..],
            })
        }
        UNSOL_TAG => {
            let code = p.get_u32()?;
            Some(Packet::Unsol {
                code,
                data: &payload[8..],
            })
        }
        _ => None,
    }
}

/// Header of an outbound request payload.
pub fn request_header(code: u32, serial: u32) -> [u8; 8] {
    let mut hdr = [0u8; 8];
    hdr[..4].copy_from_slice(&(code as i32).to_le_bytes());
    hdr[4..].copy_from_slice(&(serial as i32).to_le_bytes());
    hdr
}

/// Reads one frame into `buf` and returns the payload slice.
pub async fn read_frame<'b, R: Read>(
    rx: &mut R,
    buf: &'b mut [u8],
) -> Result<&'b [u8], FrameError<R::Error>> {
    let mut len = [0u8; 4];
    rx.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > buf.len() {
        return Err(FrameError::TooLong(len));
    }
    rx.read_exact(&mut buf[..len]).await?;
    Ok(&buf[..len])
}

/// Writes one frame assembled from `parts`.
pub async fn write_frame<W: Write>(tx: &mut W, parts: &[&[u8]]) -> Result<(), W::Error> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    tx.write_all(&(len as u32).to_be_bytes()).await?;
    for part in parts {
        tx.write_all(part).await?;
    }
    tx.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response() {
        let mut payload = [0u8; 16];
        payload[0..4].copy_from_slice(&0i32.to_le_bytes());
        payload[4..8].copy_from_slice(&7u32.to_le_bytes());
        payload[8..12].copy_from_slice(&2i32.to_le_bytes());
        payload[12..16].copy_from_slice(&0x55aa_1122u32.to_le_bytes());
        match parse(&payload) {
            Some(Packet::Response {
                serial,
                status,
                data,
            }) => {
                assert_eq!(serial, 7);
                assert_eq!(status, 2);
                assert_eq!(data.len(), 4);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn parse_unsol() {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&1i32.to_le_bytes());
        payload[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(
            parse(&payload),
            Some(Packet::Unsol {
                code: 1000,
                data: &[]
            })
        );
    }

    #[test]
    fn parse_garbage() {
        assert!(parse(&[9, 0, 0, 0]).is_none());
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn header_layout() {
        let hdr = request_header(23, 5);
        assert_eq!(&hdr[..4], &23i32.to_le_bytes());
        assert_eq!(&hdr[4..], &5i32.to_le_bytes());
    }
}
