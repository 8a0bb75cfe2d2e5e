use alloc::alloc::Global;
use core::alloc::Allocator;
use core::fmt;

use crate::KVec;

/// An owned, growable, UTF-8 string, generic over an [`Allocator`] — the
/// container analog of `alloc::string::String`, which is not generic over
/// its allocator in stable `alloc`.
pub struct KString<A: Allocator = Global> {
    bytes: KVec<u8, A>,
}

impl KString<Global> {
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for KString<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> KString<A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            bytes: KVec::new_in(alloc),
        }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every mutator below only appends valid UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.bytes) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn push_str(&mut self, s: &str) {
        self.bytes.extend_from_slice(s.as_bytes());
    }

    pub fn push(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.push_str(c.encode_utf8(&mut buf));
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl<A: Allocator> PartialEq for KString<A> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<A: Allocator> Eq for KString<A> {}

impl<A: Allocator> core::hash::Hash for KString<A> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl<A: Allocator> core::ops::Deref for KString<A> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<A: Allocator> fmt::Display for KString<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<A: Allocator> fmt::Write for KString<A> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl From<&str> for KString<Global> {
    fn from(s: &str) -> Self {
        let mut out = KString::new();
        out.push_str(s);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write as _;

    #[test]
    fn push_and_format() {
        let mut s = KString::new();
        s.push_str("hello");
        s.push(' ');
        write!(s, "{}", 42).unwrap();
        assert_eq!(s.as_str(), "hello 42");
    }
}
