// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! All integers travel big-endian. Reads track the remaining length and fail
//! with [`TpmError::Size`] instead of reading past the end; writes append and
//! never fail, the response size limit is enforced by the framer.

use super::error::{Result, TpmError};

/// Append-only output buffer
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Write a zero u32 placeholder and return its position
    pub fn reserve_u32(&mut self) -> usize {
        let pos = self.data.len();
        self.put_u32(0);
        pos
    }

    pub fn update_u16(&mut self, pos: usize, v: u16) {
        self.data[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor over an input byte area with remaining-length tracking
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(TpmError::Size);
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Borrow the next `len` bytes without copying
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Get a TPM2B structure (2-byte size prefix + data) whose size may not exceed `max`
    pub fn get_tpm2b(&mut self, max: usize) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        if size > max {
            return Err(TpmError::Size);
        }
        self.get_bytes(size)
    }

    /// Take the remaining bytes
    pub fn get_remaining(&mut self) -> &'a [u8] {
        let v = &self.data[self.pos..];
        self.pos = self.data.len();
        v
    }

    /// Fail if any byte is left unconsumed
    pub fn ensure_consumed(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(TpmError::Size);
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut WriteBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WriteBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self>;

    /// Unmarshal from a byte slice that must be consumed exactly
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ReadBuffer::new(data);
        let v = Self::unmarshal(&mut buf)?;
        buf.ensure_consumed()?;
        Ok(v)
    }
}

// Implement Marshal for primitive types
impl Marshal for u8 {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u32(*self);
    }
}

impl Marshal for u64 {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u64(*self);
    }
}

impl Marshal for i32 {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_i32(*self);
    }
}

// Implement Unmarshal for primitive types
impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

impl Unmarshal for u64 {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        buf.get_u64()
    }
}

impl Unmarshal for i32 {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        buf.get_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_reads() {
        let data = [0x80, 0x02, 0x00, 0x00, 0x01, 0x7F, 0xFF, 0xFF, 0xFF, 0xFE];
        let mut buf = ReadBuffer::new(&data);
        assert_eq!(buf.get_u16().unwrap(), 0x8002);
        assert_eq!(buf.get_u32().unwrap(), 0x0000017F);
        assert_eq!(buf.remaining(), 4);
        assert_eq!(buf.get_i32().unwrap(), -2);
        assert_eq!(buf.remaining(), 0);
        buf.ensure_consumed().unwrap();
    }

    #[test]
    fn test_underflow_does_not_consume() {
        let data = [0x01, 0x02, 0x03];
        let mut buf = ReadBuffer::new(&data);
        assert_eq!(buf.get_u32(), Err(TpmError::Size));
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.get_u16().unwrap(), 0x0102);
        assert_eq!(buf.get_u16(), Err(TpmError::Size));
    }

    #[test]
    fn test_tpm2b_bounds() {
        // Declared size above the field maximum
        let data = [0x00, 0x05, 1, 2, 3, 4, 5];
        assert_eq!(ReadBuffer::new(&data).get_tpm2b(4), Err(TpmError::Size));
        assert_eq!(ReadBuffer::new(&data).get_tpm2b(5).unwrap(), vec![1, 2, 3, 4, 5]);

        // Declared size above the remaining length
        let data = [0x00, 0x05, 1, 2];
        assert_eq!(ReadBuffer::new(&data).get_tpm2b(64), Err(TpmError::Size));
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        assert_eq!(u16::from_bytes(&[0x12, 0x34]).unwrap(), 0x1234);
        assert_eq!(u16::from_bytes(&[0x12, 0x34, 0x00]), Err(TpmError::Size));
    }

    #[test]
    fn test_write_buffer_size_patch() {
        let mut buf = WriteBuffer::new();
        buf.put_u16(0x8001);
        let pos = buf.reserve_u32();
        buf.put_tpm2b(&[0xAA, 0xBB]);
        buf.update_u32(pos, buf.len() as u32);
        assert_eq!(
            buf.as_bytes(),
            &[0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x02, 0xAA, 0xBB]
        );
    }
}
