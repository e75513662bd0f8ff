//! Code blocks extracted from LLM replies.
//!
//! Blocks are kept per task in a [`BlockStore`] that records the full
//! history and the latest version per name. Re-adding a name bumps the
//! version counter; the `edit` tool creates new versions the same way.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One named, language-tagged unit of executable source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Name unique within one reply; defaulted by the parser when the
    /// model did not supply one.
    pub name: String,

    /// Fence language tag, lowercased.
    pub lang: String,

    /// Raw source text.
    pub source: String,

    /// Ordinal position within the reply it came from.
    pub position: usize,

    /// Version within the owning task, starting at 1.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl CodeBlock {
    pub fn new(
        name: impl Into<String>,
        lang: impl Into<String>,
        source: impl Into<String>,
        position: usize,
    ) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
            source: source.into(),
            position,
            version: 1,
        }
    }
}

/// Failure applying an `edit` tool call to a stored block.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("no block named `{0}`")]
    UnknownBlock(String),
    #[error("pattern not found in block `{0}`")]
    PatternNotFound(String),
}

/// Per-task collection of code blocks.
///
/// Keeps every version ever added (`history`) plus an index of the latest
/// version per name. Blocks with the same name across rounds are distinct
/// entries; only the version counter ties them together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStore {
    history: Vec<CodeBlock>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block, bumping its version if the name is already known.
    /// Returns a reference to the stored block.
    pub fn add(&mut self, mut block: CodeBlock) -> &CodeBlock {
        if let Some(existing) = self.get(&block.name) {
            block.version = existing.version + 1;
            tracing::debug!(block = %block.name, version = block.version, "Block updated");
        }
        self.history.push(block);
        self.history.last().unwrap()
    }

    /// Returns the latest version of the named block.
    pub fn get(&self, name: &str) -> Option<&CodeBlock> {
        self.history.iter().rev().find(|b| b.name == name)
    }

    /// Applies a string replacement to the latest version of a block,
    /// storing the result as a new version.
    pub fn edit(
        &mut self,
        name: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<&CodeBlock, EditError> {
        let current = self
            .get(name)
            .ok_or_else(|| EditError::UnknownBlock(name.to_string()))?;
        if !current.source.contains(old) {
            return Err(EditError::PatternNotFound(name.to_string()));
        }
        let source = if replace_all {
            current.source.replace(old, new)
        } else {
            current.source.replacen(old, new, 1)
        };
        let edited = CodeBlock {
            name: current.name.clone(),
            lang: current.lang.clone(),
            source,
            position: current.position,
            version: current.version,
        };
        Ok(self.add(edited))
    }

    /// All versions ever stored, in insertion order.
    pub fn history(&self) -> &[CodeBlock] {
        &self.history
    }

    /// Number of stored versions (not distinct names).
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_bumps_version_for_same_name() {
        let mut store = BlockStore::new();
        store.add(CodeBlock::new("main", "python", "print(1)", 0));
        let second = store.add(CodeBlock::new("main", "python", "print(2)", 0));
        assert_eq!(second.version, 2);
        assert_eq!(store.get("main").unwrap().source, "print(2)");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_unknown_block() {
        let store = BlockStore::new();
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn test_edit_creates_new_version() {
        let mut store = BlockStore::new();
        store.add(CodeBlock::new("calc", "python", "x = 1\nprint(x)", 0));

        let edited = store.edit("calc", "x = 1", "x = 2", false).unwrap();
        assert_eq!(edited.version, 2);
        assert_eq!(edited.source, "x = 2\nprint(x)");
        // The original version is still in history.
        assert_eq!(store.history()[0].source, "x = 1\nprint(x)");
    }

    #[test]
    fn test_edit_replace_all() {
        let mut store = BlockStore::new();
        store.add(CodeBlock::new("calc", "python", "a, a, a", 0));
        let edited = store.edit("calc", "a", "b", true).unwrap();
        assert_eq!(edited.source, "b, b, b");
    }

    #[test]
    fn test_edit_pattern_not_found() {
        let mut store = BlockStore::new();
        store.add(CodeBlock::new("calc", "python", "x = 1", 0));
        let err = store.edit("calc", "y = 2", "z", false).unwrap_err();
        assert!(matches!(err, EditError::PatternNotFound(_)));
        // No new version was stored.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_edit_unknown_block() {
        let mut store = BlockStore::new();
        let err = store.edit("ghost", "a", "b", false).unwrap_err();
        assert!(matches!(err, EditError::UnknownBlock(_)));
    }
}
