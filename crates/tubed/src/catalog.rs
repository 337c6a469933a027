//! Stitch content catalog.
//!
//! Loaded from a JSON file when one is given. Without a file (or for ids the
//! file does not list) content is generated for well-formed ids
//! `{thread}-{NNNN}`, so a player can run against an empty backend.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use tube_common::StitchContent;

const QUESTIONS_PER_STITCH: u64 = 10;

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<StitchContent>),
    Wrapped { stitches: Vec<StitchContent> },
}

#[derive(Debug, Default)]
pub struct Catalog {
    stitches: HashMap<String, StitchContent>,
    generate: bool,
}

impl Catalog {
    /// Empty catalog that generates content on demand
    pub fn generated() -> Self {
        Self {
            stitches: HashMap::new(),
            generate: true,
        }
    }

    /// Fixed catalog, no generation
    pub fn from_stitches(stitches: Vec<StitchContent>) -> Self {
        Self {
            stitches: stitches.into_iter().map(|s| (s.id.clone(), s)).collect(),
            generate: false,
        }
    }

    /// Load a JSON array of stitches, or `{"stitches": [...]}`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let parsed: CatalogFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        let stitches = match parsed {
            CatalogFile::List(list) => list,
            CatalogFile::Wrapped { stitches } => stitches,
        };
        info!("Loaded {} stitches from {}", stitches.len(), path.display());
        Ok(Self::from_stitches(stitches))
    }

    pub fn len(&self) -> usize {
        self.stitches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stitches.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<StitchContent> {
        if let Some(stitch) = self.stitches.get(id) {
            return Some(stitch.clone());
        }
        if self.generate {
            return generate(id);
        }
        None
    }
}

/// Addition drills seeded by the stitch number
fn generate(id: &str) -> Option<StitchContent> {
    let (thread, number) = id.rsplit_once('-')?;
    if thread.is_empty() || number.len() != 4 {
        return None;
    }
    let seq: u64 = number.parse().ok()?;

    let questions = (0..QUESTIONS_PER_STITCH)
        .map(|i| {
            let a = seq + i;
            let b = (seq * 7 + i * 3) % 10 + 1;
            let answer = a + b;
            json!({
                "prompt": format!("{} + {}", a, b),
                "answer": answer,
                "distractors": [answer + 1, answer.saturating_sub(1), answer + 10],
            })
        })
        .collect();

    Some(StitchContent {
        id: id.to_string(),
        thread_id: Some(thread.to_string()),
        title: Some(format!("{} #{}", thread, seq)),
        questions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_content_for_well_formed_ids() {
        let catalog = Catalog::generated();
        let stitch = catalog.get("t1-0007").unwrap();
        assert_eq!(stitch.thread_id.as_deref(), Some("t1"));
        assert_eq!(stitch.questions.len(), 10);
        assert_eq!(catalog.get("t1-0007").unwrap(), stitch);
    }

    #[test]
    fn test_malformed_ids_are_unknown() {
        let catalog = Catalog::generated();
        assert!(catalog.get("nohyphen").is_none());
        assert!(catalog.get("t1-7").is_none());
        assert!(catalog.get("-0001").is_none());
    }

    #[test]
    fn test_fixed_catalog_does_not_generate() {
        let catalog = Catalog::from_stitches(vec![StitchContent {
            id: "a".into(),
            thread_id: None,
            title: None,
            questions: vec![],
        }]);
        assert!(catalog.get("a").is_some());
        assert!(catalog.get("t1-0001").is_none());
    }

    #[test]
    fn test_load_accepts_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"id": "x"}]"#).unwrap();
        assert_eq!(Catalog::load(&list).unwrap().len(), 1);

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"stitches": [{"id": "x"}, {"id": "y"}]}"#).unwrap();
        assert_eq!(Catalog::load(&wrapped).unwrap().len(), 2);
    }
}
