//! String Interning
//!
//! Influencer field names and values recur across every bucket, so they
//! are stored once and referred to by a small handle. The interner is
//! owned by the caller and passed by reference to whatever needs to
//! intern or resolve strings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Handle to an interned string.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interned(u32);

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Interner {
    strings: Vec<String>,
    #[serde(skip)]
    lookup: HashMap<String, Interned>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> Interned {
        if self.lookup.len() != self.strings.len() {
            self.rebuild_lookup();
        }
        if let Some(&handle) = self.lookup.get(s) {
            return handle;
        }
        let handle = Interned(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), handle);
        handle
    }

    pub fn get(&self, s: &str) -> Option<Interned> {
        match self.lookup.get(s) {
            Some(&handle) => Some(handle),
            // Lookup is not persisted.
            None => self.strings.iter().position(|x| x == s).map(|i| Interned(i as u32)),
        }
    }

    pub fn resolve(&self, handle: Interned) -> Option<&str> {
        self.strings.get(handle.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    fn rebuild_lookup(&mut self) {
        self.lookup = self.strings.iter().enumerate().map(|(i, s)| (s.clone(), Interned(i as u32))).collect();
    }
}
