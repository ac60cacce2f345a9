//! Fixed-width and length-prefixed primitives shared by the message codec
//! and the node metadata serializer.
//!
//! Integers are big-endian. Byte strings are prefixed with a `u16` length,
//! which caps any single field at 65 535 bytes.

use bytes::{Buf, BufMut};

use crate::store::StoreError;

pub fn put_u8<B: BufMut>(buf: &mut B, v: u8) {
    buf.put_u8(v);
}

pub fn put_u16<B: BufMut>(buf: &mut B, v: u16) {
    buf.put_u16(v);
}

pub fn put_u32<B: BufMut>(buf: &mut B, v: u32) {
    buf.put_u32(v);
}

pub fn put_u64<B: BufMut>(buf: &mut B, v: u64) {
    buf.put_u64(v);
}

/// Length-prefixed byte string. Values longer than `u16::MAX` cannot be
/// represented on the wire.
pub fn put_bytes<B: BufMut>(buf: &mut B, v: &[u8]) {
    debug_assert!(v.len() <= u16::MAX as usize);
    buf.put_u16(v.len() as u16);
    buf.put_slice(v);
}

pub fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, StoreError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, StoreError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, StoreError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, StoreError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, StoreError> {
    let n = get_u16(buf)? as usize;
    ensure(buf, n)?;
    let mut out = vec![0u8; n];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn ensure<B: Buf>(buf: &B, n: usize) -> Result<(), StoreError> {
    if buf.remaining() < n {
        return Err(StoreError::Underflow);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip_primitives() {
        let mut buf = BytesMut::new();
        put_u8(&mut buf, 0xab);
        put_u16(&mut buf, 0xbeef);
        put_u32(&mut buf, 0xdead_beef);
        put_u64(&mut buf, 0x0123_4567_89ab_cdef);
        put_bytes(&mut buf, b"slate");

        let mut rd = buf.freeze();
        assert_eq!(get_u8(&mut rd).unwrap(), 0xab);
        assert_eq!(get_u16(&mut rd).unwrap(), 0xbeef);
        assert_eq!(get_u32(&mut rd).unwrap(), 0xdead_beef);
        assert_eq!(get_u64(&mut rd).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(get_bytes(&mut rd).unwrap(), b"slate");
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn big_endian_layout() {
        let mut buf = BytesMut::new();
        put_u16(&mut buf, 0x0102);
        assert_eq!(&buf[..], &[0x01, 0x02]);
    }

    #[test]
    fn short_buffer_underflows() {
        let mut rd = bytes::Bytes::from_static(&[0x00, 0x05, b'a']);
        assert!(matches!(get_bytes(&mut rd), Err(StoreError::Underflow)));

        let mut rd = bytes::Bytes::from_static(&[0x01]);
        assert!(matches!(get_u64(&mut rd), Err(StoreError::Underflow)));
    }
}
