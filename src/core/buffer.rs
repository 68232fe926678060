//! Cursor-based byte writer and reader.
//!
//! Every multi-byte scalar, floats included, is written in network (big-endian)
//! byte order. Strings and blobs are `{u32 len}{bytes}`; lists use the layout
//! `{u32 total}{u32 count}{(u32 len, bytes) * count}` where `total` counts every
//! byte after itself.

use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Growable big-endian writer
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_u32(v.to_bits());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_u64(v.to_bits());
    }

    pub fn write_char(&mut self, v: char) {
        self.buf.put_u32(u32::from(v));
    }

    /// Raw bytes with no length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// `{u32 len}{utf8}`
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_blob(s.as_bytes())
    }

    /// `{u32 len}{bytes}`
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| ProtocolError::OversizedPacket(bytes.len()))?;
        self.buf.put_u32(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Overwrite a previously written u32 at `offset`
    pub fn patch_u32(&mut self, offset: usize, v: u32) -> Result<()> {
        let slot = self
            .buf
            .get_mut(offset..offset + 4)
            .ok_or_else(|| ProtocolError::Serialization(format!("patch offset {offset} out of range")))?;
        slot.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Write a list using the length-prefixed element layout.
    ///
    /// `write_item` encodes one element into a scratch writer; its length is
    /// prefixed automatically.
    pub fn write_list<T, F>(&mut self, items: &[T], mut write_item: F) -> Result<()>
    where
        F: FnMut(&mut ByteWriter, &T) -> Result<()>,
    {
        let count = u32::try_from(items.len())
            .map_err(|_| ProtocolError::Serialization("list too long".into()))?;
        let total_at = self.buf.len();
        self.write_u32(0);
        self.write_u32(count);
        let mut scratch = ByteWriter::new();
        for item in items {
            scratch.buf.clear();
            write_item(&mut scratch, item)?;
            self.write_blob(&scratch.buf)?;
        }
        let total = self.buf.len() - total_at - 4;
        let total = u32::try_from(total).map_err(|_| ProtocolError::OversizedPacket(total))?;
        self.patch_u32(total_at, total)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Checked big-endian reader over a borrowed slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn truncated(wanted: usize, remaining: usize) -> ProtocolError {
    ProtocolError::Deserialization(format!(
        "{}: wanted {wanted} bytes, {remaining} remaining",
        constants::ERR_TRUNCATED_BODY
    ))
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail if any bytes are left unread
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(ProtocolError::Deserialization(format!(
                "{}: {} bytes",
                constants::ERR_TRAILING_BYTES,
                self.remaining()
            )))
        }
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(truncated(n, self.remaining()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_be_bytes(self.read_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid bool byte {other}"
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_char(&mut self) -> Result<char> {
        let scalar = self.read_u32()?;
        char::from_u32(scalar)
            .ok_or_else(|| ProtocolError::Deserialization(format!("invalid char {scalar:#x}")))
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_slice(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_blob()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| ProtocolError::Deserialization(format!("invalid utf-8: {e}")))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_array()
    }

    /// Read a list written by [`ByteWriter::write_list`].
    ///
    /// Each element is handed to `read_item` as its own bounded reader, which
    /// must consume it exactly.
    pub fn read_list<T, F>(&mut self, mut read_item: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut ByteReader<'a>) -> Result<T>,
    {
        let total = self.read_u32()? as usize;
        let body = self.read_slice(total)?;
        let mut inner = ByteReader::new(body);
        let count = inner.read_u32()? as usize;
        // Every element carries at least its own 4-byte length
        if count > inner.remaining() / 4 {
            return Err(ProtocolError::Deserialization(format!(
                "list claims {count} elements in {} bytes",
                inner.remaining()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let element = inner.read_blob()?;
            let mut element_reader = ByteReader::new(element);
            items.push(read_item(&mut element_reader)?);
            element_reader.finish()?;
        }
        inner.finish()?;
        Ok(items)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = ByteWriter::new();
        w.write_u32(0x0102_0304);
        w.write_i16(-2);
        assert_eq!(w.as_slice(), &[1, 2, 3, 4, 0xff, 0xfe]);
    }

    #[test]
    fn test_floats_are_big_endian() {
        let mut w = ByteWriter::new();
        w.write_f32(1.0);
        assert_eq!(w.as_slice(), &[0x3f, 0x80, 0x00, 0x00]);
        let mut r = ByteReader::new(w.as_slice());
        assert_eq!(r.read_f32().unwrap(), 1.0);
    }

    #[test]
    fn test_string_layout() {
        let mut w = ByteWriter::new();
        w.write_string("hi").unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_list_layout() {
        let mut w = ByteWriter::new();
        w.write_list(&[7u8, 9u8], |w, v| {
            w.write_u8(*v);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            w.as_slice(),
            &[0, 0, 0, 14, 0, 0, 0, 2, 0, 0, 0, 1, 7, 0, 0, 0, 1, 9]
        );
        let mut r = ByteReader::new(w.as_slice());
        let items = r.read_list(|r| r.read_u8()).unwrap();
        assert_eq!(items, vec![7, 9]);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut r = ByteReader::new(&[0, 0, 0, 9, 1]);
        assert!(r.read_blob().is_err());
    }

    #[test]
    fn test_list_count_bomb_rejected() {
        let mut w = ByteWriter::new();
        w.write_u32(4);
        w.write_u32(u32::MAX);
        let mut r = ByteReader::new(w.as_slice());
        assert!(r.read_list(|r| r.read_u8()).is_err());
    }

    #[test]
    fn test_element_must_be_consumed() {
        let mut w = ByteWriter::new();
        w.write_list(&[1u16], |w, v| {
            w.write_u16(*v);
            Ok(())
        })
        .unwrap();
        let mut r = ByteReader::new(w.as_slice());
        assert!(r.read_list(|r| r.read_u8()).is_err());
    }

    #[test]
    fn test_invalid_char_rejected() {
        let mut w = ByteWriter::new();
        w.write_u32(0xD800);
        assert!(ByteReader::new(w.as_slice()).read_char().is_err());
    }
}
