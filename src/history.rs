// 🗂️ Conversation History
// Bounded in-memory question/response log. Feeds model prompts only;
// classification and routing never read it.

use crate::question::Category;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

/// Responses are cut to this many characters inside prompt context
pub const CONTEXT_RESPONSE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    pub category: Category,
    pub response: String,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    limit: usize,
    entries: VecDeque<Exchange>,
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        ConversationHistory {
            limit,
            entries: VecDeque::with_capacity(limit),
        }
    }

    pub fn record(&mut self, question: &str, category: Category, response: &str) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(Exchange {
            question: question.to_string(),
            category,
            response: response.to_string(),
            asked_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Exchange> {
        self.entries.iter()
    }

    /// Last `pairs` exchanges as prompt text, oldest first
    pub fn context(&self, pairs: usize) -> String {
        let skip = self.entries.len().saturating_sub(pairs);
        self.entries
            .iter()
            .skip(skip)
            .map(|e| {
                format!(
                    "Pregunta anterior: {}\nRespuesta anterior: {}",
                    e.question,
                    truncate_chars(&e.response, CONTEXT_RESPONSE_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// How often each category was asked
    pub fn category_counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.category).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn export(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries.iter().collect::<Vec<_>>())
            .context("Failed to serialize conversation history")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}
