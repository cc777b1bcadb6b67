//! Content providers
//!
//! A content provider is the byte source for one image: the URL/data
//! layer owns it and the cache identifies reps by its id. The provider
//! exposes a contiguous window of not-yet-consumed bytes; the loader
//! consumes exactly what the decoder accepted and asks the window to
//! `grow` when a single syntactic unit is larger than the window.

/// Identity of one content provider; the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub u64);

/// A byte source for one image
pub trait ContentProvider {
    /// Cache identity
    fn id(&self) -> ProviderId;

    /// The current contiguous window of unconsumed bytes, and whether
    /// more bytes exist (or may arrive) beyond what the window shows.
    fn data(&self) -> (&[u8], bool);

    /// Discard `n` bytes from the front of the window.
    fn consume(&mut self, n: usize);

    /// Ask for a larger contiguous window. Returns false when the
    /// window cannot grow (the no-progress signal for the loader).
    fn grow(&mut self) -> bool;

    /// Restart the stream from the first byte.
    fn rewind(&mut self);

    /// True once every byte of the resource has arrived.
    fn is_loaded(&self) -> bool;

    /// Declared MIME type, possibly empty.
    fn content_type(&self) -> &str;

    /// Correct the declared type after sniffing.
    fn set_content_type(&mut self, tag: &str);
}

/// In-memory provider for tests and synthetic images. Bytes arrive via
/// `append`; the window is bounded to exercise the grow path.
pub struct MemoryProvider {
    id: ProviderId,
    content_type: String,
    bytes: Vec<u8>,
    consumed: usize,
    window: usize,
    max_window: usize,
    finished: bool,
}

impl MemoryProvider {
    pub fn new(id: ProviderId, content_type: &str) -> Self {
        Self {
            id,
            content_type: content_type.to_string(),
            bytes: Vec::new(),
            consumed: 0,
            window: 4096,
            max_window: usize::MAX,
            finished: false,
        }
    }

    /// Provider pre-filled with a complete resource
    pub fn loaded(id: ProviderId, content_type: &str, bytes: &[u8]) -> Self {
        let mut provider = Self::new(id, content_type);
        provider.append(bytes);
        provider.finish();
        provider
    }

    /// Cap both the initial window and how far `grow` may enlarge it
    pub fn with_window(mut self, window: usize, max_window: usize) -> Self {
        self.window = window;
        self.max_window = max_window;
        self
    }

    /// More bytes arrived from the network
    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// The resource is complete
    pub fn finish(&mut self) {
        self.finished = true;
    }
}

impl ContentProvider for MemoryProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn data(&self) -> (&[u8], bool) {
        let available = self.bytes.len() - self.consumed;
        let shown = available.min(self.window);
        let more = !self.finished || shown < available;
        (&self.bytes[self.consumed..self.consumed + shown], more)
    }

    fn consume(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.bytes.len());
    }

    fn grow(&mut self) -> bool {
        if self.window >= self.max_window {
            return false;
        }
        self.window = self.window.saturating_mul(2).min(self.max_window);
        true
    }

    fn rewind(&mut self) {
        self.consumed = 0;
    }

    fn is_loaded(&self) -> bool {
        self.finished
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn set_content_type(&mut self, tag: &str) {
        self.content_type = tag.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_and_consume() {
        let mut p = MemoryProvider::new(ProviderId(1), "image/gif").with_window(4, 16);
        p.append(&[1, 2, 3, 4, 5, 6]);
        let (data, more) = p.data();
        assert_eq!(data, &[1, 2, 3, 4]);
        assert!(more);
        p.consume(2);
        let (data, _) = p.data();
        assert_eq!(data, &[3, 4, 5, 6]);
        p.finish();
        p.consume(4);
        let (data, more) = p.data();
        assert!(data.is_empty());
        assert!(!more);
    }

    #[test]
    fn test_grow_bounded() {
        let mut p = MemoryProvider::new(ProviderId(1), "").with_window(2, 4);
        p.append(&[0; 10]);
        assert!(p.grow());
        assert_eq!(p.data().0.len(), 4);
        assert!(!p.grow());
    }
}
