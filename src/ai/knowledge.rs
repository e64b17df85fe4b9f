//! Onboard question/answer store used while offline.
//!
//! Answers come from a bundled set of pairs plus a user file that grows as
//! queued questions get answered online. Lookup is a plain word-set Jaccard
//! match; anything below [`KNOWLEDGE_MATCH_THRESHOLD`] is treated as no answer.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::KNOWLEDGE_MATCH_THRESHOLD;

const BUNDLED_KNOWLEDGE: &str = include_str!("../../data/knowledge_base.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub q: String,
    pub a: String,
}

#[derive(Debug, Default)]
struct Pairs {
    bundled: Vec<QaPair>,
    learned: Vec<QaPair>,
}

/// Thread-safe local knowledge base. Shared between the ask path and the
/// reconciliation worker.
#[derive(Debug)]
pub struct LocalKnowledgeBase {
    user_path: Option<PathBuf>,
    pairs: Mutex<Pairs>,
}

impl LocalKnowledgeBase {
    /// Bundled pairs plus whatever the user file holds. A missing or corrupt
    /// user file starts empty.
    pub fn load(user_path: &Path) -> Self {
        let learned = match std::fs::read_to_string(user_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %user_path.display(), error = %e, "ignoring unreadable knowledge file");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            user_path: Some(user_path.to_path_buf()),
            pairs: Mutex::new(Pairs {
                bundled: bundled_pairs(),
                learned,
            }),
        }
    }

    /// In-memory knowledge base; `learn` never touches disk.
    #[cfg(test)]
    pub fn in_memory(pairs: Vec<QaPair>) -> Self {
        Self {
            user_path: None,
            pairs: Mutex::new(Pairs {
                bundled: pairs,
                learned: Vec::new(),
            }),
        }
    }

    /// Best-matching answer, if any pair clears the similarity threshold.
    pub fn search(&self, question: &str) -> Option<String> {
        let pairs = self.pairs.lock().ok()?;
        let mut best: Option<(f64, &QaPair)> = None;
        for pair in pairs.bundled.iter().chain(pairs.learned.iter()) {
            let score = jaccard_similarity(question, &pair.q);
            if score > best.map_or(0.0, |(s, _)| s) {
                best = Some((score, pair));
            }
        }
        match best {
            Some((score, pair)) if score >= KNOWLEDGE_MATCH_THRESHOLD && !pair.a.is_empty() => {
                Some(pair.a.clone())
            }
            _ => None,
        }
    }

    /// Remember an answered question and persist the learned pairs.
    pub fn learn(&self, question: &str, answer: &str) -> Result<()> {
        let mut pairs = self
            .pairs
            .lock()
            .map_err(|_| anyhow::anyhow!("knowledge base lock poisoned"))?;
        pairs.learned.push(QaPair {
            q: question.to_string(),
            a: answer.to_string(),
        });

        let Some(path) = &self.user_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&pairs.learned)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Number of known question/answer pairs, bundled and learned.
    pub fn len(&self) -> usize {
        self.pairs
            .lock()
            .map(|p| p.bundled.len() + p.learned.len())
            .unwrap_or(0)
    }
}

fn bundled_pairs() -> Vec<QaPair> {
    serde_json::from_str(BUNDLED_KNOWLEDGE).unwrap_or_else(|e| {
        tracing::error!(error = %e, "bundled knowledge base is malformed");
        Vec::new()
    })
}

/// Word-set Jaccard similarity, case-insensitive.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let sa: HashSet<&str> = lower_a.split_whitespace().collect();
    let sb: HashSet<&str> = lower_b.split_whitespace().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    inter as f64 / union.max(1) as f64
}
