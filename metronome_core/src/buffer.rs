//! A byte container with small-object optimization for message payloads.
//!
//! Payloads are short in the steady state; keeping them inline avoids a heap
//! allocation per message. Three storage modes: inline (up to
//! [`SmallBuffer::INLINE_CAPACITY`] bytes), owned heap, and a non-owning
//! span over external memory ([`bytes::Bytes`]). A locked buffer refuses any
//! operation that would move its storage to a new allocation.

use bytes::Bytes;
use serde::{de::Visitor, Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    /// The operation needed a new allocation but the buffer is locked in
    /// place.
    #[error("buffer is locked and the operation would reallocate")]
    LockedReallocation,
}

#[derive(Debug, Clone)]
enum Storage {
    Inline { data: [u8; SmallBuffer::INLINE_CAPACITY], len: usize },
    Heap(Vec<u8>),
    /// Read-only alias of external memory. Mutation copies out first.
    Span(Bytes),
}

#[derive(Debug, Clone)]
pub struct SmallBuffer {
    storage: Storage,
    locked: bool,
}

impl Default for SmallBuffer {
    fn default() -> Self {
        SmallBuffer::new()
    }
}

impl SmallBuffer {
    pub const INLINE_CAPACITY: usize = 64;

    pub const fn new() -> Self {
        SmallBuffer {
            storage: Storage::Inline { data: [0u8; Self::INLINE_CAPACITY], len: 0 },
            locked: false,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        if capacity <= Self::INLINE_CAPACITY {
            SmallBuffer::new()
        } else {
            SmallBuffer { storage: Storage::Heap(Vec::with_capacity(capacity)), locked: false }
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline { len, .. } => *len,
            Storage::Heap(v) => v.len(),
            Storage::Span(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity available without a new allocation. A span has no writable
    /// capacity of its own.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Inline { .. } => Self::INLINE_CAPACITY,
            Storage::Heap(v) => v.capacity(),
            Storage::Span(_) => 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline { data, len } => &data[..*len],
            Storage::Heap(v) => v,
            Storage::Span(b) => b,
        }
    }

    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lock or unlock the buffer against storage reallocation.
    pub fn lock(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// True when the buffer aliases external memory.
    pub fn is_span(&self) -> bool {
        matches!(self.storage, Storage::Span(_))
    }

    /// Make the contents writable in place with room for `needed` bytes.
    fn ensure_owned(&mut self, needed: usize) -> Result<(), BufferError> {
        match &mut self.storage {
            Storage::Inline { .. } if needed <= Self::INLINE_CAPACITY => Ok(()),
            Storage::Inline { data, len } => {
                if self.locked {
                    return Err(BufferError::LockedReallocation);
                }
                let mut v = Vec::with_capacity(needed);
                v.extend_from_slice(&data[..*len]);
                self.storage = Storage::Heap(v);
                Ok(())
            }
            Storage::Heap(v) => {
                if needed > v.capacity() && self.locked {
                    return Err(BufferError::LockedReallocation);
                }
                v.reserve(needed.saturating_sub(v.len()));
                Ok(())
            }
            Storage::Span(b) => {
                let needed = needed.max(b.len());
                if needed <= Self::INLINE_CAPACITY {
                    let mut data = [0u8; Self::INLINE_CAPACITY];
                    data[..b.len()].copy_from_slice(b);
                    let len = b.len();
                    self.storage = Storage::Inline { data, len };
                    Ok(())
                } else if self.locked {
                    Err(BufferError::LockedReallocation)
                } else {
                    let mut v = Vec::with_capacity(needed);
                    v.extend_from_slice(b);
                    self.storage = Storage::Heap(v);
                    Ok(())
                }
            }
        }
    }

    pub fn reserve(&mut self, capacity: usize) -> Result<(), BufferError> {
        self.ensure_owned(capacity.max(self.len()))
    }

    /// Resize to `size` bytes, zero-filling any extension.
    pub fn resize(&mut self, size: usize) -> Result<(), BufferError> {
        self.resize_with(size, 0)
    }

    pub fn resize_with(&mut self, size: usize, fill: u8) -> Result<(), BufferError> {
        self.ensure_owned(size)?;
        match &mut self.storage {
            Storage::Inline { data, len } => {
                if size > *len {
                    data[*len..size].fill(fill);
                }
                *len = size;
            }
            Storage::Heap(v) => v.resize(size, fill),
            Storage::Span(_) => unreachable!("ensure_owned converted the span"),
        }
        Ok(())
    }

    pub fn assign(&mut self, contents: &[u8]) -> Result<(), BufferError> {
        self.ensure_owned(contents.len())?;
        match &mut self.storage {
            Storage::Inline { data, len } => {
                data[..contents.len()].copy_from_slice(contents);
                *len = contents.len();
            }
            Storage::Heap(v) => {
                v.clear();
                v.extend_from_slice(contents);
            }
            Storage::Span(_) => unreachable!("ensure_owned converted the span"),
        }
        Ok(())
    }

    pub fn append(&mut self, contents: &[u8]) -> Result<(), BufferError> {
        let new_len = self.len() + contents.len();
        self.ensure_owned(new_len)?;
        match &mut self.storage {
            Storage::Inline { data, len } => {
                data[*len..new_len].copy_from_slice(contents);
                *len = new_len;
            }
            Storage::Heap(v) => v.extend_from_slice(contents),
            Storage::Span(_) => unreachable!("ensure_owned converted the span"),
        }
        Ok(())
    }

    pub fn push_back(&mut self, byte: u8) -> Result<(), BufferError> {
        self.append(&[byte])
    }

    pub fn pop_back(&mut self) -> Option<u8> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let last = self.as_bytes()[len - 1];
        match &mut self.storage {
            Storage::Inline { len, .. } => *len -= 1,
            Storage::Heap(v) => {
                v.pop();
            }
            Storage::Span(b) => {
                // shrinking a view needs no writable storage
                *b = b.slice(..len - 1);
            }
        }
        Some(last)
    }

    /// Guarantee a NUL byte directly past the contents without changing the
    /// logical size. Appends-then-pops, so the terminator lands in existing
    /// spare capacity whenever there is any.
    pub fn null_terminate(&mut self) -> Result<(), BufferError> {
        self.push_back(0)?;
        self.pop_back();
        Ok(())
    }

    /// Take ownership of an existing allocation, dropping the previous
    /// storage. A locked buffer copies the contents instead of adopting the
    /// allocation.
    pub fn move_assign(&mut self, contents: Vec<u8>) -> Result<(), BufferError> {
        if self.locked {
            return self.assign(&contents);
        }
        self.storage = Storage::Heap(contents);
        Ok(())
    }

    /// Alias external memory without copying. The buffer holds a read-only
    /// view; mutation copies out of the span first.
    pub fn span_assign(&mut self, view: Bytes) -> Result<(), BufferError> {
        if self.locked {
            return self.assign(&view);
        }
        self.storage = Storage::Span(view);
        Ok(())
    }

    /// Yield the contents as an owned heap allocation and revert to an empty
    /// inline buffer. Inline and span contents are copied out.
    pub fn release(&mut self) -> Vec<u8> {
        let storage = std::mem::replace(
            &mut self.storage,
            Storage::Inline { data: [0u8; Self::INLINE_CAPACITY], len: 0 },
        );
        match storage {
            Storage::Inline { data, len } => data[..len].to_vec(),
            Storage::Heap(v) => v,
            Storage::Span(b) => b.to_vec(),
        }
    }

    pub fn clear(&mut self) {
        match &mut self.storage {
            Storage::Inline { len, .. } => *len = 0,
            Storage::Heap(v) => v.clear(),
            Storage::Span(_) => {
                self.storage = Storage::Inline { data: [0u8; Self::INLINE_CAPACITY], len: 0 }
            }
        }
    }
}

impl PartialEq for SmallBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SmallBuffer {}

impl PartialEq<[u8]> for SmallBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl PartialEq<&str> for SmallBuffer {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl From<&[u8]> for SmallBuffer {
    fn from(contents: &[u8]) -> Self {
        let mut buf = SmallBuffer::new();
        buf.assign(contents).expect("new buffer is unlocked");
        buf
    }
}

impl From<&str> for SmallBuffer {
    fn from(contents: &str) -> Self {
        SmallBuffer::from(contents.as_bytes())
    }
}

impl From<String> for SmallBuffer {
    fn from(contents: String) -> Self {
        SmallBuffer { storage: Storage::Heap(contents.into_bytes()), locked: false }
    }
}

impl From<Vec<u8>> for SmallBuffer {
    fn from(contents: Vec<u8>) -> Self {
        SmallBuffer { storage: Storage::Heap(contents), locked: false }
    }
}

impl Serialize for SmallBuffer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_bytes())
    }
}

struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = SmallBuffer;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a byte buffer")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(SmallBuffer::from(v))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(SmallBuffer::from(v))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut v = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            v.push(byte);
        }
        Ok(SmallBuffer::from(v))
    }
}

impl<'de> Deserialize<'de> for SmallBuffer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_inline_below_capacity() {
        let mut buf = SmallBuffer::new();
        buf.assign(&[1u8; 64]).unwrap();
        assert!(matches!(buf.storage, Storage::Inline { .. }));
        buf.push_back(2).unwrap();
        assert!(matches!(buf.storage, Storage::Heap(_)));
        assert_eq!(buf.len(), 65);
    }

    #[test]
    fn assignment_preserves_bytes() {
        let src = SmallBuffer::from("hello world");
        let dst = src.clone();
        assert_eq!(dst, src);
        assert_eq!(dst.to_str(), Some("hello world"));
    }

    #[test]
    fn locked_buffer_refuses_reallocation() {
        let mut buf = SmallBuffer::from(&[0u8; 64][..]);
        buf.lock(true);
        assert_eq!(buf.push_back(1), Err(BufferError::LockedReallocation));
        assert_eq!(buf.len(), 64);
        buf.lock(false);
        buf.push_back(1).unwrap();
    }

    #[test]
    fn locked_move_assign_degrades_to_copy() {
        let mut buf = SmallBuffer::from("short");
        buf.lock(true);
        buf.move_assign(vec![7u8; 8]).unwrap();
        assert_eq!(buf.as_bytes(), &[7u8; 8][..]);
        assert!(matches!(buf.storage, Storage::Inline { .. }));
    }

    #[test]
    fn span_mutation_copies_out() {
        let external = Bytes::from_static(b"external data");
        let mut buf = SmallBuffer::new();
        buf.span_assign(external.clone()).unwrap();
        assert!(buf.is_span());
        buf.push_back(b'!').unwrap();
        assert!(!buf.is_span());
        assert_eq!(buf.as_bytes(), b"external data!");
        // the external allocation is untouched
        assert_eq!(&external[..], b"external data");
    }

    #[test]
    fn release_reverts_to_empty() {
        let mut buf = SmallBuffer::from(vec![1, 2, 3]);
        let taken = buf.release();
        assert_eq!(taken, vec![1, 2, 3]);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), SmallBuffer::INLINE_CAPACITY);
    }

    #[test]
    fn null_terminate_keeps_size() {
        let mut buf = SmallBuffer::from("abc");
        buf.null_terminate().unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_bytes(), b"abc");
    }
}
