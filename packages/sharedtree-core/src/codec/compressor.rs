use std::collections::HashMap;

use uuid::Uuid;

/// Maps stable string identifiers to dense numeric ids and back.
pub trait IdCompressor {
    fn try_recompress(&self, stable: &str) -> Option<i64>;
    fn decompress(&self, compressed: i64) -> Option<&str>;
}

/// In-memory compressor that hands out ids in registration order.
#[derive(Clone, Debug, Default)]
pub struct MemoryIdCompressor {
    stable: Vec<String>,
    compressed: HashMap<String, i64>,
}

impl MemoryIdCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh stable identifier and returns it.
    pub fn generate(&mut self) -> String {
        let stable = Uuid::new_v4().to_string();
        self.register(&stable);
        stable
    }

    pub fn register(&mut self, stable: &str) -> i64 {
        if let Some(id) = self.compressed.get(stable) {
            return *id;
        }
        let id = self.stable.len() as i64;
        self.stable.push(stable.to_owned());
        self.compressed.insert(stable.to_owned(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.stable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stable.is_empty()
    }
}

impl IdCompressor for MemoryIdCompressor {
    fn try_recompress(&self, stable: &str) -> Option<i64> {
        self.compressed.get(stable).copied()
    }

    fn decompress(&self, compressed: i64) -> Option<&str> {
        usize::try_from(compressed)
            .ok()
            .and_then(|i| self.stable.get(i))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let mut ids = MemoryIdCompressor::new();
        let a = ids.register("a");
        let generated = ids.generate();
        assert_eq!(ids.register("a"), a);
        assert_eq!(ids.try_recompress(&generated), Some(1));
        assert_eq!(ids.decompress(1), Some(generated.as_str()));
        assert_eq!(ids.decompress(-1), None);
        assert_eq!(ids.try_recompress("unknown"), None);
    }
}
