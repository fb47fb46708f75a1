//! Wire layout for pool persistence.
//!
//! Layout: a header with the entry and static counts, a length-prefixed
//! UTF-8 string table in ID order, then the ID→refcount table. A refcount of
//! zero above the static prefix marks a freed slot.

use crate::StringPool;

/// Errors produced when reading a serialised pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Stream ended before the declared layout was complete.
    Truncated,
    /// A string-table entry was not valid UTF-8.
    InvalidUtf8 { id: u32 },
    /// The static count exceeded the entry count.
    BadHeader,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "pool stream truncated"),
            WireError::InvalidUtf8 { id } => write!(f, "entry {id} is not valid UTF-8"),
            WireError::BadHeader => write!(f, "static count exceeds entry count"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serialise `pool` into a byte vector.
pub fn write_pool(pool: &StringPool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut refcounts: Vec<i64> = Vec::new();
    let mut count: u32 = 0;

    // Reserve header space; patched once the entry count is known.
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&pool.num_static().to_le_bytes());

    pool.for_each_entry(|_, text, refcount| {
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        refcounts.push(refcount);
        count += 1;
    });

    out[0..4].copy_from_slice(&count.to_le_bytes());
    for rc in refcounts {
        out.extend_from_slice(&rc.to_le_bytes());
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.offset.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.data.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }
}

/// Reconstruct a pool from bytes produced by [`write_pool`].
pub fn read_pool(data: &[u8]) -> Result<StringPool, WireError> {
    let mut reader = Reader { data, offset: 0 };
    let count = reader.u32()?;
    let num_static = reader.u32()?;
    if num_static > count {
        return Err(WireError::BadHeader);
    }

    let mut texts: Vec<String> = Vec::with_capacity(count as usize);
    for id in 0..count {
        let len = reader.u32()? as usize;
        let bytes = reader.take(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8 { id })?;
        texts.push(text.to_owned());
    }

    let mut entries = Vec::with_capacity(count as usize);
    for text in texts {
        let refcount = reader.i64()?;
        entries.push((text, refcount));
    }

    Ok(StringPool::from_entries(num_static, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_preserves_ids_and_counts() {
        let pool = StringPool::with_static_strings(["add", "if"]);
        let hello = pool.intern("hello");
        pool.intern_id(hello);
        let world = pool.intern("world");
        pool.release(world); // leaves a freed slot

        let bytes = write_pool(&pool);
        let restored = read_pool(&bytes).expect("round trip");

        assert_eq!(restored.num_static(), pool.num_static());
        assert_eq!(restored.get(hello), "hello");
        assert_eq!(restored.get_id("add"), pool.get_id("add"));
        assert_eq!(restored.stats(), pool.stats());

        // The freed slot must be reusable after the round trip.
        let reused = restored.intern("fresh");
        assert_eq!(reused, world);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let pool = StringPool::new();
        pool.intern("abc");
        let bytes = write_pool(&pool);
        let err = read_pool(&bytes[..bytes.len() - 1]).map(|_| ()).unwrap_err();
        assert_eq!(err, WireError::Truncated);
    }
}
