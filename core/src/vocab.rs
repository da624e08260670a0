//! Vocabulary: the bidirectional word <-> index table shared by every model,
//! count store and lattice of a session.
//!
//! `Vocab` is a cheap clonable handle around shared state, so a model, the
//! counts it was estimated from and the lattices it rescores all agree on
//! word indices. Indices are stable for the lifetime of the table.
use ahash::{AHashMap, AHashSet};
use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use std::io::{BufRead, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::file::LineReader;

pub type VocabIndex = u32;

/// "No word": terminates contexts, labels null lattice nodes.
pub const VOCAB_NONE: VocabIndex = u32::MAX;

pub const SENTENCE_START: &str = "<s>";
pub const SENTENCE_END: &str = "</s>";
pub const UNKNOWN_WORD: &str = "<unk>";
pub const PAUSE_WORD: &str = "-pau-";

#[derive(Debug, Default)]
struct VocabTable {
    words: Vec<String>,
    index: AHashMap<String, VocabIndex>,
    non_events: AHashSet<VocabIndex>,
    unk_is_word: bool,
    to_lower: bool,
    normalize: bool,
}

impl VocabTable {
    fn canonical(&self, word: &str) -> String {
        let mut w = if self.normalize {
            crate::utils::normalize(word)
        } else {
            word.to_string()
        };
        if self.to_lower {
            w = w.to_lowercase();
        }
        w
    }

    fn insert(&mut self, word: &str) -> VocabIndex {
        let w = self.canonical(word);
        if let Some(&idx) = self.index.get(&w) {
            return idx;
        }
        let idx = self.words.len() as VocabIndex;
        self.index.insert(w.clone(), idx);
        self.words.push(w);
        idx
    }
}

#[derive(Clone, Debug)]
pub struct Vocab {
    inner: Arc<RwLock<VocabTable>>,
    ss: VocabIndex,
    se: VocabIndex,
    unk: VocabIndex,
    pause: VocabIndex,
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocab {
    /// A table holding only the special tokens.
    pub fn new() -> Self {
        let mut table = VocabTable::default();
        let ss = table.insert(SENTENCE_START);
        let se = table.insert(SENTENCE_END);
        let unk = table.insert(UNKNOWN_WORD);
        let pause = table.insert(PAUSE_WORD);
        table.non_events.insert(ss);
        table.non_events.insert(pause);
        Self {
            inner: Arc::new(RwLock::new(table)),
            ss,
            se,
            unk,
            pause,
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, VocabTable> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, VocabTable> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// True when both handles refer to the same table.
    pub fn same_table(&self, other: &Vocab) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn ss_index(&self) -> VocabIndex {
        self.ss
    }

    pub fn se_index(&self) -> VocabIndex {
        self.se
    }

    pub fn unk_index(&self) -> VocabIndex {
        self.unk
    }

    pub fn pause_index(&self) -> VocabIndex {
        self.pause
    }

    /// Index of `word`, adding it when new.
    pub fn add_word(&self, word: &str) -> VocabIndex {
        {
            let table = self.table();
            let w = table.canonical(word);
            if let Some(&idx) = table.index.get(&w) {
                return idx;
            }
        }
        self.table_mut().insert(word)
    }

    pub fn add_words(&self, words: &[&str]) -> Vec<VocabIndex> {
        let mut table = self.table_mut();
        words.iter().map(|w| table.insert(w)).collect()
    }

    pub fn get_index(&self, word: &str) -> Option<VocabIndex> {
        let table = self.table();
        let w = table.canonical(word);
        table.index.get(&w).copied()
    }

    /// Index of `word`, or the unknown-word index for out-of-vocabulary input.
    pub fn index_or_unk(&self, word: &str) -> VocabIndex {
        self.get_index(word).unwrap_or(self.unk)
    }

    pub fn lookup_words(&self, words: &[&str]) -> Vec<VocabIndex> {
        words.iter().map(|w| self.index_or_unk(w)).collect()
    }

    pub fn get_word(&self, index: VocabIndex) -> Option<String> {
        self.table().words.get(index as usize).cloned()
    }

    /// Printable form of an index; null nodes print as `NULL`.
    pub fn display_word(&self, index: VocabIndex) -> String {
        if index == VOCAB_NONE {
            return "NULL".to_string();
        }
        self.get_word(index).unwrap_or_else(|| format!("<{}>", index))
    }

    pub fn words_of(&self, indices: &[VocabIndex]) -> Vec<String> {
        indices.iter().map(|&i| self.display_word(i)).collect()
    }

    pub fn len(&self) -> usize {
        self.table().words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> Vec<VocabIndex> {
        (0..self.len() as VocabIndex).collect()
    }

    /// Words that can be predicted: everything except non-events, and
    /// except `<unk>` unless it is modelled as a regular word.
    pub fn event_indices(&self) -> Vec<VocabIndex> {
        let table = self.table();
        (0..table.words.len() as VocabIndex)
            .filter(|i| !table.non_events.contains(i))
            .filter(|&i| i != self.unk || table.unk_is_word)
            .collect()
    }

    pub fn is_non_event(&self, index: VocabIndex) -> bool {
        index == VOCAB_NONE || self.table().non_events.contains(&index)
    }

    pub fn add_non_event(&self, index: VocabIndex) {
        self.table_mut().non_events.insert(index);
    }

    pub fn remove_non_event(&self, index: VocabIndex) {
        self.table_mut().non_events.remove(&index);
    }

    pub fn unk_is_word(&self) -> bool {
        self.table().unk_is_word
    }

    pub fn set_unk_is_word(&self, on: bool) {
        self.table_mut().unk_is_word = on;
    }

    pub fn set_to_lower(&self, on: bool) {
        self.table_mut().to_lower = on;
    }

    /// Apply NFC normalization to words on insertion and lookup.
    pub fn set_normalize(&self, on: bool) {
        self.table_mut().normalize = on;
    }

    /// Compare two indices by their spelling.
    pub fn compare(&self, a: VocabIndex, b: VocabIndex) -> std::cmp::Ordering {
        let table = self.table();
        let wa = table.words.get(a as usize).map(String::as_str).unwrap_or("");
        let wb = table.words.get(b as usize).map(String::as_str).unwrap_or("");
        wa.cmp(wb)
    }

    pub fn is_multiword(&self, index: VocabIndex, delim: char) -> bool {
        self.get_word(index)
            .map(|w| w.len() > 1 && w.trim_matches(delim).contains(delim))
            .unwrap_or(false)
    }

    /// Component indices of a multiword token (`a_b_c` -> `a`, `b`, `c`),
    /// adding components to the table as needed. Non-multiwords map to
    /// themselves.
    pub fn split_multiword(&self, index: VocabIndex, delim: char) -> Vec<VocabIndex> {
        let word = match self.get_word(index) {
            Some(w) => w,
            None => return vec![index],
        };
        let parts: Vec<&str> = word.split(delim).filter(|p| !p.is_empty()).collect();
        if parts.len() <= 1 {
            return vec![index];
        }
        self.add_words(&parts)
    }

    /// Read a word list, one word per line (first field).
    pub fn read<R: BufRead>(&self, input: &mut LineReader<R>) -> Result<usize> {
        let mut n = 0;
        while let Some(line) = input.next_line()? {
            if let Some(word) = line.split_whitespace().next() {
                self.add_word(word);
                n += 1;
            }
        }
        Ok(n)
    }

    /// Write all words in spelling order.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut words = self.table().words.clone();
        words.sort();
        for w in words {
            writeln!(out, "{}", w)?;
        }
        Ok(())
    }

    /// Freeze the table into an fst map (word -> index).
    pub fn to_fst(&self) -> Result<Map<Vec<u8>>> {
        let table = self.table();
        let mut entries: Vec<(&str, u64)> = table
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.as_str(), i as u64))
            .collect();
        entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut builder = MapBuilder::memory();
        for (w, i) in entries {
            builder.insert(w, i)?;
        }
        Ok(Map::new(builder.into_inner()?)?)
    }

    /// Add every key of an fst map, returning a translation from the map's
    /// values to indices of this table.
    pub fn merge_fst(&self, map: &Map<Vec<u8>>) -> AHashMap<u64, VocabIndex> {
        let mut translation = AHashMap::with_capacity(map.len());
        let mut stream = map.into_stream();
        let mut table = self.table_mut();
        while let Some((key, value)) = stream.next() {
            let word = String::from_utf8_lossy(key);
            translation.insert(value, table.insert(&word));
        }
        translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_tokens_exist() {
        let v = Vocab::new();
        assert_eq!(v.get_index("<s>"), Some(v.ss_index()));
        assert_eq!(v.get_index("</s>"), Some(v.se_index()));
        assert!(v.is_non_event(v.ss_index()));
        assert!(v.is_non_event(v.pause_index()));
        assert!(!v.is_non_event(v.se_index()));
        assert!(v.is_non_event(VOCAB_NONE));
    }

    #[test]
    fn handles_share_the_table() {
        let v = Vocab::new();
        let other = v.clone();
        let a = other.add_word("alpha");
        assert_eq!(v.get_index("alpha"), Some(a));
        assert_eq!(v.add_word("alpha"), a);
        assert!(v.same_table(&other));
        assert_eq!(v.index_or_unk("missing"), v.unk_index());
    }

    #[test]
    fn event_indices_exclude_unk_unless_word() {
        let v = Vocab::new();
        v.add_word("a");
        assert!(!v.event_indices().contains(&v.unk_index()));
        v.set_unk_is_word(true);
        assert!(v.event_indices().contains(&v.unk_index()));
        assert!(!v.event_indices().contains(&v.ss_index()));
    }

    #[test]
    fn lowercase_and_normalization() {
        let v = Vocab::new();
        v.set_to_lower(true);
        v.set_normalize(true);
        let a = v.add_word("Cafe\u{301}");
        assert_eq!(v.get_index("caf\u{e9}"), Some(a));
    }

    #[test]
    fn splits_multiwords() {
        let v = Vocab::new();
        let m = v.add_word("new_york_city");
        assert!(v.is_multiword(m, '_'));
        let parts = v.split_multiword(m, '_');
        assert_eq!(v.words_of(&parts), vec!["new", "york", "city"]);
        let plain = v.add_word("boston");
        assert_eq!(v.split_multiword(plain, '_'), vec![plain]);
    }

    #[test]
    fn fst_export_reimports() {
        let v = Vocab::new();
        v.add_words(&["zeta", "alpha", "mid"]);
        let map = v.to_fst().unwrap();
        assert_eq!(map.len(), v.len());

        let fresh = Vocab::new();
        let tr = fresh.merge_fst(&map);
        let old = map.get("alpha").unwrap();
        assert_eq!(fresh.get_word(tr[&old]).as_deref(), Some("alpha"));
    }
}
