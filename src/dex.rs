//! A minimal dex-file model: enough identity for the deterministic layout
//! order (registration index, class-def indices, string-id indices) and for
//! mapping classes and interned strings to their defining file. Parsing and
//! verification of real dex bytes live outside this crate.

use std::collections::HashMap;
use std::sync::Arc;

/// One input dex file.
pub struct DexFile {
    location: String,
    /// Class descriptors in class-def order.
    class_descriptors: Vec<String>,
    class_def_index: HashMap<String, u32>,
    /// String-id table in string-id order.
    strings: Vec<String>,
    string_id_index: HashMap<String, u32>,
}

impl DexFile {
    pub fn new(
        location: impl Into<String>,
        class_descriptors: Vec<String>,
        strings: Vec<String>,
    ) -> Arc<DexFile> {
        let class_def_index = class_descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.clone(), i as u32))
            .collect();
        let string_id_index = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Arc::new(DexFile {
            location: location.into(),
            class_descriptors,
            class_def_index,
            strings,
            string_id_index,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn num_class_defs(&self) -> usize {
        self.class_descriptors.len()
    }

    pub fn class_def_index(&self, descriptor: &str) -> Option<u32> {
        self.class_def_index.get(descriptor).copied()
    }

    pub fn num_string_ids(&self) -> usize {
        self.strings.len()
    }

    pub fn string_id_index(&self, s: &str) -> Option<u32> {
        self.string_id_index.get(s).copied()
    }

    pub fn string(&self, string_id: u32) -> &str {
        &self.strings[string_id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_declaration_order() {
        let dex = DexFile::new(
            "core.dex",
            vec!["LA;".to_string(), "LB;".to_string()],
            vec!["a".to_string(), "b".to_string()],
        );
        assert_eq!(dex.class_def_index("LA;"), Some(0));
        assert_eq!(dex.class_def_index("LB;"), Some(1));
        assert_eq!(dex.class_def_index("LC;"), None);
        assert_eq!(dex.string_id_index("b"), Some(1));
        assert_eq!(dex.string(0), "a");
    }
}
