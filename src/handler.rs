//! Positioned binary I/O over a seekable stream.
//!
//! [`FileHandler`] wraps any `Read + Seek` / `Write + Seek` stream and
//! addresses it relative to a base offset, so a nested container embedded
//! at byte `N` of its parent sees its own header at position 0.
//!
//! # Deferred string table
//! Variable-length strings that live outside the fixed-width records are
//! not written at the point of use.  The writer calls
//! [`FileHandler::string_table_add`] immediately before emitting a u64
//! placeholder, and a single [`FileHandler::string_table_flush`] later
//! appends every registered string (UTF-16LE, NUL-terminated) in
//! registration order and patches each placeholder with the offset the
//! string landed at.
//!
//! # Endianness
//! All multi-byte values are little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Round `pos` up to the next multiple of `align`.
pub fn align_up(pos: u64, align: u64) -> u64 {
    if align <= 1 {
        pos
    } else {
        pos.div_ceil(align) * align
    }
}

pub struct FileHandler<S> {
    stream:       S,
    offset:       u64,
    /// (placeholder position, value) in registration order.
    string_table: Vec<(u64, String)>,
}

impl<S> FileHandler<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, offset: 0, string_table: Vec::new() }
    }

    /// Absolute stream position that relative position 0 maps to.
    pub fn offset(&self) -> u64 { self.offset }

    pub fn get_ref(&self) -> &S { &self.stream }

    pub fn into_inner(self) -> S { self.stream }

    /// Number of strings waiting for the next flush.
    pub fn pending_strings(&self) -> usize { self.string_table.len() }
}

impl<S: Read> Read for FileHandler<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<S: Write> Write for FileHandler<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

// ── Positioning ──────────────────────────────────────────────────────────────

impl<S: Seek> FileHandler<S> {
    /// Current position relative to the base offset.
    pub fn tell(&mut self) -> io::Result<u64> {
        Ok(self.stream.stream_position()?.saturating_sub(self.offset))
    }

    pub fn seek(&mut self, pos: u64) -> io::Result<()> {
        let abs = rebase(self.offset, pos)?;
        self.stream.seek(SeekFrom::Start(abs))?;
        Ok(())
    }

    /// Seek forward to the next `align` boundary.  Returns the new position.
    pub fn align(&mut self, align: u64) -> io::Result<u64> {
        let pos = align_up(self.tell()?, align);
        self.seek(pos)?;
        Ok(pos)
    }

    /// Run `f` with positions rebased to `offset` (relative to the current
    /// base) and an empty string table of its own.  The previous base and
    /// pending strings are restored afterwards, also on error.
    pub fn scoped<T, E, F>(&mut self, offset: u64, f: F) -> Result<T, E>
    where
        E: From<io::Error>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let base          = rebase(self.offset, offset)?;
        let saved_offset  = self.offset;
        let saved_strings = std::mem::take(&mut self.string_table);
        self.offset = base;
        let result = f(self);
        self.offset       = saved_offset;
        self.string_table = saved_strings;
        result
    }
}

fn rebase(base: u64, pos: u64) -> io::Result<u64> {
    base.checked_add(pos).ok_or_else(|| io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Position {pos:#x} past base {base:#x} overflows"),
    ))
}

// ── Reading ──────────────────────────────────────────────────────────────────

impl<S: Read + Seek> FileHandler<S> {
    pub fn read_u8(&mut self)  -> io::Result<u8>  { self.stream.read_u8() }
    pub fn read_i8(&mut self)  -> io::Result<i8>  { self.stream.read_i8() }
    pub fn read_u16(&mut self) -> io::Result<u16> { self.stream.read_u16::<LittleEndian>() }
    pub fn read_i16(&mut self) -> io::Result<i16> { self.stream.read_i16::<LittleEndian>() }
    pub fn read_u32(&mut self) -> io::Result<u32> { self.stream.read_u32::<LittleEndian>() }
    pub fn read_i32(&mut self) -> io::Result<i32> { self.stream.read_i32::<LittleEndian>() }
    pub fn read_u64(&mut self) -> io::Result<u64> { self.stream.read_u64::<LittleEndian>() }
    pub fn read_i64(&mut self) -> io::Result<i64> { self.stream.read_i64::<LittleEndian>() }
    pub fn read_f32(&mut self) -> io::Result<f32> { self.stream.read_f32::<LittleEndian>() }
    pub fn read_f64(&mut self) -> io::Result<f64> { self.stream.read_f64::<LittleEndian>() }

    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a NUL-terminated UTF-16LE string at `pos` without moving the
    /// cursor.
    pub fn read_wstring_at(&mut self, pos: u64) -> io::Result<String> {
        let saved = self.tell()?;
        self.seek(pos)?;
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 { break; }
            units.push(unit);
        }
        self.seek(saved)?;
        decode_utf16(&units, pos)
    }

    /// Read an inline string: u32 character count (terminator included)
    /// followed by that many UTF-16LE units.
    pub fn read_inline_wstring(&mut self) -> io::Result<String> {
        let start = self.tell()?;
        let count = self.read_u32()? as usize;
        // the count is untrusted; a short stream ends in UnexpectedEof
        let mut units = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            units.push(self.read_u16()?);
        }
        while units.last() == Some(&0) {
            units.pop();
        }
        decode_utf16(&units, start)
    }
}

fn decode_utf16(units: &[u16], pos: u64) -> io::Result<String> {
    String::from_utf16(units).map_err(|_| io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Invalid UTF-16 string at offset {pos}"),
    ))
}

// ── Writing ──────────────────────────────────────────────────────────────────

impl<S: Write + Seek> FileHandler<S> {
    pub fn write_u8(&mut self, v: u8)   -> io::Result<()> { self.stream.write_u8(v) }
    pub fn write_i8(&mut self, v: i8)   -> io::Result<()> { self.stream.write_i8(v) }
    pub fn write_u16(&mut self, v: u16) -> io::Result<()> { self.stream.write_u16::<LittleEndian>(v) }
    pub fn write_i16(&mut self, v: i16) -> io::Result<()> { self.stream.write_i16::<LittleEndian>(v) }
    pub fn write_u32(&mut self, v: u32) -> io::Result<()> { self.stream.write_u32::<LittleEndian>(v) }
    pub fn write_i32(&mut self, v: i32) -> io::Result<()> { self.stream.write_i32::<LittleEndian>(v) }
    pub fn write_u64(&mut self, v: u64) -> io::Result<()> { self.stream.write_u64::<LittleEndian>(v) }
    pub fn write_i64(&mut self, v: i64) -> io::Result<()> { self.stream.write_i64::<LittleEndian>(v) }
    pub fn write_f32(&mut self, v: f32) -> io::Result<()> { self.stream.write_f32::<LittleEndian>(v) }
    pub fn write_f64(&mut self, v: f64) -> io::Result<()> { self.stream.write_f64::<LittleEndian>(v) }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Zero-pad up to the next `align` boundary.  Returns the new position.
    pub fn write_align(&mut self, align: u64) -> io::Result<u64> {
        let pos     = self.tell()?;
        let aligned = align_up(pos, align);
        if aligned > pos {
            self.stream.write_all(&vec![0u8; (aligned - pos) as usize])?;
        }
        Ok(aligned)
    }

    /// Write a NUL-terminated UTF-16LE string.
    pub fn write_wstring(&mut self, value: &str) -> io::Result<()> {
        for unit in value.encode_utf16() {
            self.write_u16(unit)?;
        }
        self.write_u16(0)
    }

    /// Counterpart of [`FileHandler::read_inline_wstring`].
    pub fn write_inline_wstring(&mut self, value: &str) -> io::Result<()> {
        let count = value.encode_utf16().count() + 1;
        self.write_u32(count as u32)?;
        self.write_wstring(value)
    }

    /// Register `value` for the next flush.  The u64 written next, at the
    /// current position, is the placeholder that gets patched.
    pub fn string_table_add(&mut self, value: &str) -> io::Result<()> {
        let pos = self.tell()?;
        self.string_table.push((pos, value.to_owned()));
        Ok(())
    }

    /// Append every pending string at the current position and patch its
    /// placeholder with the string's offset.
    pub fn string_table_flush(&mut self) -> io::Result<()> {
        for (placeholder, value) in std::mem::take(&mut self.string_table) {
            let at = self.tell()?;
            self.write_wstring(&value)?;
            let end = self.tell()?;
            self.seek(placeholder)?;
            self.write_u64(at)?;
            self.seek(end)?;
        }
        Ok(())
    }

    /// Seek to `pos`, run `f`, then return to where the cursor was.
    pub fn rewrite_at<T, E, F>(&mut self, pos: u64, f: F) -> Result<T, E>
    where
        E: From<io::Error>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let saved = self.tell()?;
        self.seek(pos)?;
        let result = f(self);
        self.seek(saved)?;
        result
    }
}
