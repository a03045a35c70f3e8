//! Out-of-band store for oversize gadget results.
//!
//! Results beyond the executor's size cap are kept here in full; the
//! conversation only carries a truncated placeholder naming the stored id,
//! so one chatty gadget cannot blow the context window.

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct OutputStore {
    entries: DashMap<String, String>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a full result, returning its retrieval id.
    pub fn store(&self, content: String) -> String {
        let id = format!("output_{}", Uuid::new_v4().simple());
        self.entries.insert(id.clone(), content);
        id
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cap `text` at `max_bytes`. Oversize text is stored in full and
    /// replaced with a truncated placeholder naming the stored id.
    pub fn cap(&self, text: String, max_bytes: usize) -> String {
        if text.len() <= max_bytes {
            return text;
        }
        let total = text.len();
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = text[..cut].to_string();
        let id = self.store(text);
        format!(
            "{}...\n[truncated, {} total chars; full output stored as {}]",
            truncated, total, id
        )
    }
}
