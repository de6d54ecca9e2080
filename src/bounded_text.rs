//! Fixed-capacity UTF-16 text so host buffers never need manual NUL bookkeeping.

/// UTF-16 text bounded by the capacity of the host buffer it will be copied into.
///
/// One code unit of the capacity is reserved for the NUL terminator the host's
/// string routines expect, so at most `capacity - 1` units of content are held.
/// Appends past that limit are truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedText {
    units: Vec<u16>,
    capacity: usize,
}

impl BoundedText {
    /// Create empty text for a host buffer of `capacity` code units.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            units: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Create text for a host buffer and fill it from `text`, truncating.
    #[must_use]
    pub fn from_str_truncated(capacity: usize, text: &str) -> Self {
        let mut bounded = Self::new(capacity);
        bounded.push_str(text);
        bounded
    }

    /// Maximum number of content units.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.capacity.saturating_sub(1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        &self.units
    }

    /// Lossy conversion for logging and tests.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }

    /// Append one unit. Returns false (and drops the unit) when full.
    pub fn push(&mut self, unit: u16) -> bool {
        if self.units.len() < self.limit() {
            self.units.push(unit);
            true
        } else {
            false
        }
    }

    /// Append as many units as fit. Returns true when everything fit.
    pub fn push_units(&mut self, units: &[u16]) -> bool {
        let room = self.limit().saturating_sub(self.units.len());
        let take = units.len().min(room);
        self.units.extend_from_slice(&units[..take]);
        take == units.len()
    }

    /// Append a Rust string as UTF-16. Returns true when everything fit.
    pub fn push_str(&mut self, text: &str) -> bool {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.push_units(&units)
    }

    /// Replace the content with `units`, truncating.
    pub fn set_units(&mut self, units: &[u16]) -> bool {
        self.units.clear();
        self.push_units(units)
    }

    /// Replace the content with `text`, truncating.
    pub fn set(&mut self, text: &str) -> bool {
        self.units.clear();
        self.push_str(text)
    }

    pub fn truncate(&mut self, len: usize) {
        self.units.truncate(len);
    }

    pub fn clear(&mut self) {
        self.units.clear();
    }

    /// Load content from a host buffer, stopping at the first NUL.
    pub fn load_from(&mut self, buffer: &[u16]) {
        let end = buffer
            .iter()
            .position(|&unit| unit == 0)
            .unwrap_or(buffer.len());
        self.set_units(&buffer[..end]);
    }

    /// Copy the content into a host buffer and NUL-terminate when there is room.
    ///
    /// Returns the number of content units written.
    pub fn copy_to(&self, buffer: &mut [u16]) -> usize {
        let count = self.units.len().min(buffer.len());
        buffer[..count].copy_from_slice(&self.units[..count]);
        if let Some(slot) = buffer.get_mut(count) {
            *slot = 0;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_str_reserves_terminator_slot() {
        let mut text = BoundedText::new(5);
        assert!(!text.push_str("hello"));
        assert_eq!(text.to_string_lossy(), "hell");
        assert_eq!(text.limit(), 4);
    }

    #[test]
    fn zero_capacity_holds_nothing() {
        let mut text = BoundedText::new(0);
        assert!(!text.push(u16::from(b'a')));
        assert!(text.is_empty());
        assert!(text.push_units(&[]));
    }

    #[test]
    fn copy_to_terminates_when_room_remains() {
        let text = BoundedText::from_str_truncated(8, "dir");
        let mut buffer = [0xFFFF_u16; 8];
        assert_eq!(text.copy_to(&mut buffer), 3);
        assert_eq!(&buffer[..4], &[u16::from(b'd'), u16::from(b'i'), u16::from(b'r'), 0]);
        assert_eq!(buffer[4], 0xFFFF);
    }

    #[test]
    fn load_from_stops_at_nul() {
        let mut text = BoundedText::new(16);
        let raw: Vec<u16> = "cd\0garbage".encode_utf16().collect();
        text.load_from(&raw);
        assert_eq!(text.to_string_lossy(), "cd");
    }

    #[test]
    fn set_replaces_previous_content() {
        let mut text = BoundedText::from_str_truncated(16, "first");
        text.set("exit");
        assert_eq!(text.to_string_lossy(), "exit");
        text.truncate(2);
        assert_eq!(text.to_string_lossy(), "ex");
        text.clear();
        assert!(text.is_empty());
    }

    proptest! {
        #[test]
        fn content_never_exceeds_limit(
            capacity in 0usize..64,
            chunks in proptest::collection::vec("[a-z\\r\\n]{0,12}", 0..8),
        ) {
            let mut text = BoundedText::new(capacity);
            for chunk in &chunks {
                text.push_str(chunk);
            }
            prop_assert!(text.len() <= capacity.saturating_sub(1));
            let joined: String = chunks.concat();
            let expected: Vec<u16> =
                joined.encode_utf16().take(capacity.saturating_sub(1)).collect();
            prop_assert_eq!(text.as_slice(), expected.as_slice());
        }
    }
}
