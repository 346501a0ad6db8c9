//! # Phrase Detection
//!
//! Maps transcript text to a vocabulary entry and an optional radius.
//!
//! ## Matching rules:
//! 1. **Normalization**: lowercase, drop punctuation, collapse whitespace
//! 2. **Longest phrase first**: "diamond block" wins over "diamond"; equal
//!    lengths keep vocabulary order
//! 3. **Whole words only**: "stone" does not fire inside "sandstone"
//!
//! ## Action gating:
//! The detector reports what was *named*. Whether an action was *requested*
//! is a separate question answered by `has_trigger`: the caller only acts when
//! the trigger phrase (default "clear chunk") is present too.
//!
//! ## Vocabulary file:
//! A JSON object mapping phrase to block id, kept in insertion order:
//! ```json
//! { "stone": "minecraft:stone", "diamond block": "minecraft:diamond_block" }
//! ```

use crate::error::{AppResult, BotError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const BLOCK_NAMESPACE: &str = "minecraft:";

fn punctuation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").expect("static regex"))
}

fn block_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^minecraft:[a-z0-9_]+$").expect("static regex"))
}

/// Radius patterns in priority order: "in N blocks", "radius N", "N blocks", trailing N.
fn radius_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"\bin\s+(\d+)\s+blocks?\b",
            r"\bradius\s+(\d+)\b",
            r"\b(\d+)\s+blocks?\b",
            r"\b(\d+)\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

/// Lowercase, strip everything but word characters and whitespace, collapse runs of whitespace.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = punctuation().replace_all(&lowered, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate a block id, adding the `minecraft:` namespace when it is missing.
///
/// ## Examples:
/// - `"stone"` becomes `"minecraft:stone"`
/// - `"Minecraft:Gold_Block"` becomes `"minecraft:gold_block"`
/// - `"minecraft:not a block"` is rejected
pub fn normalize_block_id(block_id: &str) -> AppResult<String> {
    let trimmed = block_id.trim().to_lowercase();
    let qualified = if trimmed.starts_with(BLOCK_NAMESPACE) {
        trimmed
    } else {
        format!("{}{}", BLOCK_NAMESPACE, trimmed)
    };

    if block_id_pattern().is_match(&qualified) {
        Ok(qualified)
    } else {
        Err(BotError::Vocabulary(format!("Invalid block id: {}", block_id)))
    }
}

/// True when the block id lives in the `minecraft:` namespace.
pub fn is_namespaced_block(block_id: &str) -> bool {
    block_id.starts_with(BLOCK_NAMESPACE)
}

/// One phrase to block mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularyEntry {
    pub phrase: String,
    pub block_id: String,
}

/// Ordered phrase table, optionally backed by a JSON file.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    entries: Vec<VocabularyEntry>,
    path: Option<PathBuf>,
}

impl Vocabulary {
    /// The vocabulary written when no file exists yet.
    pub fn default_entries() -> Vec<VocabularyEntry> {
        [
            ("stone", "minecraft:stone"),
            ("cobblestone", "minecraft:cobblestone"),
            ("dirt", "minecraft:dirt"),
            ("diamond block", "minecraft:diamond_block"),
            ("gold block", "minecraft:gold_block"),
        ]
        .iter()
        .map(|(phrase, block_id)| VocabularyEntry {
            phrase: phrase.to_string(),
            block_id: block_id.to_string(),
        })
        .collect()
    }

    /// In-memory vocabulary, never persisted.
    pub fn from_pairs<I, P, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, B)>,
        P: Into<String>,
        B: Into<String>,
    {
        let mut vocabulary = Self::default();
        for (phrase, block_id) in pairs {
            vocabulary.insert(normalize(&phrase.into()), block_id.into());
        }
        vocabulary
    }

    /// Load the vocabulary from `path`, creating it with the defaults if missing.
    ///
    /// Block ids are taken as written; only `add` validates them. Entries with a
    /// non-string value are skipped with a warning.
    pub fn load_or_create(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::warn!("Vocabulary file not found at {}, creating defaults", path.display());
            let vocabulary = Self {
                entries: Self::default_entries(),
                path: Some(path.to_path_buf()),
            };
            vocabulary.save()?;
            return Ok(vocabulary);
        }

        let contents = fs::read_to_string(path)?;
        let object: Map<String, Value> = serde_json::from_str(&contents)?;

        let mut vocabulary = Self {
            entries: Vec::with_capacity(object.len()),
            path: Some(path.to_path_buf()),
        };
        for (phrase, value) in object {
            match value {
                Value::String(block_id) => vocabulary.insert(normalize(&phrase), block_id),
                other => tracing::warn!("Skipping vocabulary entry '{}': {} is not a string", phrase, other),
            }
        }

        tracing::info!("Loaded {} vocabulary entries from {}", vocabulary.len(), path.display());
        Ok(vocabulary)
    }

    /// Write the vocabulary back to its file. No-op for in-memory vocabularies.
    pub fn save(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let object: Map<String, Value> = self
            .entries
            .iter()
            .map(|e| (e.phrase.clone(), Value::String(e.block_id.clone())))
            .collect();
        fs::write(path, serde_json::to_string_pretty(&Value::Object(object))?)?;
        Ok(())
    }

    /// Add or replace a mapping and persist it.
    ///
    /// Returns the normalized `(phrase, block_id)` actually stored.
    pub fn add(&mut self, phrase: &str, block_id: &str) -> AppResult<(String, String)> {
        let phrase = normalize(phrase);
        if phrase.is_empty() {
            return Err(BotError::Vocabulary("Phrase cannot be empty".to_string()));
        }
        let block_id = normalize_block_id(block_id)?;

        self.insert(phrase.clone(), block_id.clone());
        self.save()?;
        tracing::info!("Added vocabulary entry: {} -> {}", phrase, block_id);
        Ok((phrase, block_id))
    }

    /// Remove a mapping and persist. Returns false when the phrase was unknown.
    pub fn remove(&mut self, phrase: &str) -> AppResult<bool> {
        let phrase = normalize(phrase);
        let before = self.entries.len();
        self.entries.retain(|e| e.phrase != phrase);
        if self.entries.len() == before {
            tracing::warn!("Vocabulary entry not found: {}", phrase);
            return Ok(false);
        }

        self.save()?;
        tracing::info!("Removed vocabulary entry: {}", phrase);
        Ok(true)
    }

    pub fn get(&self, phrase: &str) -> Option<&str> {
        let phrase = normalize(phrase);
        self.entries
            .iter()
            .find(|e| e.phrase == phrase)
            .map(|e| e.block_id.as_str())
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn insert(&mut self, phrase: String, block_id: String) {
        if phrase.is_empty() {
            return;
        }
        match self.entries.iter_mut().find(|e| e.phrase == phrase) {
            Some(existing) => existing.block_id = block_id,
            None => self.entries.push(VocabularyEntry { phrase, block_id }),
        }
    }
}

/// A vocabulary phrase found in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub block_id: String,
    pub radius: u32,
    pub matched_phrase: String,
    pub speaker_id: Option<u64>,
    pub original_text: String,
    pub detected_at: DateTime<Utc>,
}

/// Radius limits applied to extracted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiusPolicy {
    pub default_radius: u32,
    pub max_radius: u32,
}

struct CompiledEntry {
    entry: VocabularyEntry,
    pattern: Regex,
}

/// Precompiled matcher over a vocabulary snapshot.
///
/// Rebuild it with `PhraseDetector::new` after the vocabulary changes.
pub struct PhraseDetector {
    entries: Vec<CompiledEntry>,
    phrases: Vec<String>,
    trigger: String,
    trigger_pattern: Option<Regex>,
    radius: RadiusPolicy,
}

impl PhraseDetector {
    pub fn new(vocabulary: &Vocabulary, trigger_phrase: &str, radius: RadiusPolicy) -> Self {
        let phrases: Vec<String> = vocabulary.entries().iter().map(|e| normalize(&e.phrase)).collect();
        let mut entries: Vec<CompiledEntry> = vocabulary
            .entries()
            .iter()
            .filter_map(|entry| {
                let phrase = normalize(&entry.phrase);
                let pattern = whole_phrase(&phrase)?;
                Some(CompiledEntry {
                    entry: VocabularyEntry {
                        phrase,
                        block_id: entry.block_id.clone(),
                    },
                    pattern,
                })
            })
            .collect();
        // Longest first by characters; stable sort keeps vocabulary order among ties
        entries.sort_by_key(|c| std::cmp::Reverse(c.entry.phrase.chars().count()));

        let trigger = normalize(trigger_phrase);
        let trigger_pattern = whole_phrase(&trigger);

        Self {
            entries,
            phrases,
            trigger,
            trigger_pattern,
            radius,
        }
    }

    /// Find the longest vocabulary phrase in `text`.
    ///
    /// ## Returns:
    /// `None` when no phrase appears as whole words. A miss is normal, not an error.
    pub fn detect(&self, text: &str, speaker_id: Option<u64>) -> Option<DetectionResult> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        let hit = self.entries.iter().find(|c| c.pattern.is_match(&normalized))?;
        let radius = self.extract_radius(&normalized);

        tracing::debug!(
            "Detected '{}' -> {} (speaker {:?}, radius {})",
            hit.entry.phrase,
            hit.entry.block_id,
            speaker_id,
            radius
        );

        Some(DetectionResult {
            block_id: hit.entry.block_id.clone(),
            radius,
            matched_phrase: hit.entry.phrase.clone(),
            speaker_id,
            original_text: text.to_string(),
            detected_at: Utc::now(),
        })
    }

    /// Radius named in already-normalized text, clamped, or the default.
    pub fn extract_radius(&self, normalized: &str) -> u32 {
        for pattern in radius_patterns() {
            if let Some(value) = pattern
                .captures(normalized)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
            {
                // Digit strings too long for u32 saturate to the cap
                let radius = value.parse::<u32>().unwrap_or(u32::MAX);
                return radius.min(self.radius.max_radius);
            }
        }
        self.radius.default_radius
    }

    /// Whether the transcript explicitly requests an action.
    pub fn has_trigger(&self, text: &str) -> bool {
        match &self.trigger_pattern {
            Some(pattern) => pattern.is_match(&normalize(text)),
            None => false,
        }
    }

    pub fn trigger_phrase(&self) -> &str {
        &self.trigger
    }

    /// Phrases the recognizer should be biased toward: every vocabulary phrase
    /// followed by the trigger words, without duplicates.
    pub fn bias_list(&self) -> Vec<String> {
        let mut bias: Vec<String> = Vec::new();
        for phrase in self.phrases.iter().map(String::as_str).chain(self.trigger.split(' ')) {
            if !phrase.is_empty() && !bias.iter().any(|b| b == phrase) {
                bias.push(phrase.to_string());
            }
        }
        bias
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn whole_phrase(phrase: &str) -> Option<Regex> {
    if phrase.is_empty() {
        return None;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(phrase))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADIUS: RadiusPolicy = RadiusPolicy {
        default_radius: 3,
        max_radius: 10,
    };

    fn detector(pairs: &[(&str, &str)]) -> PhraseDetector {
        let vocabulary = Vocabulary::from_pairs(pairs.iter().copied());
        PhraseDetector::new(&vocabulary, "clear chunk", RADIUS)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Clear, CHUNK!   stone?? "), "clear chunk stone");
        assert_eq!(normalize("..."), "");
    }

    #[test]
    fn test_longest_phrase_wins() {
        let d = detector(&[("diamond", "minecraft:diamond_ore"), ("diamond block", "minecraft:diamond_block")]);
        let hit = d.detect("give me diamond block please", Some(1)).unwrap();
        assert_eq!(hit.block_id, "minecraft:diamond_block");
        assert_eq!(hit.matched_phrase, "diamond block");
        assert_eq!(hit.speaker_id, Some(1));
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // "ñuñu" is 6 bytes but only 4 characters
        let d = detector(&[("ñuñu", "minecraft:snow"), ("abcde", "minecraft:stone")]);
        let hit = d.detect("ñuñu abcde", None).unwrap();
        assert_eq!(hit.matched_phrase, "abcde");
        assert_eq!(hit.block_id, "minecraft:stone");
    }

    #[test]
    fn test_equal_length_keeps_vocabulary_order() {
        let d = detector(&[("sand", "minecraft:sand"), ("dirt", "minecraft:dirt")]);
        let hit = d.detect("dirt and sand", None).unwrap();
        assert_eq!(hit.block_id, "minecraft:sand");
    }

    #[test]
    fn test_whole_word_guard() {
        let d = detector(&[("sand", "minecraft:sand"), ("stone", "minecraft:stone")]);
        assert!(d.detect("sandstone", None).is_none());
        assert!(d.detect("stones everywhere", None).is_none());
    }

    #[test]
    fn test_radius_extraction() {
        let d = detector(&[("stone", "minecraft:stone")]);
        assert_eq!(d.detect("clear chunk stone in 5 blocks", None).unwrap().radius, 5);
        assert_eq!(d.detect("clear chunk stone radius 3", None).unwrap().radius, 3);
        assert_eq!(d.detect("clear chunk stone 7 blocks", None).unwrap().radius, 7);
        assert_eq!(d.detect("clear chunk stone 4", None).unwrap().radius, 4);
        assert_eq!(d.detect("clear chunk stone", None).unwrap().radius, 3);
    }

    #[test]
    fn test_radius_is_clamped() {
        let d = detector(&[("stone", "minecraft:stone")]);
        for requested in [0u32, 1, 9, 10, 11, 50, 4_000_000_000] {
            let text = format!("stone radius {}", requested);
            assert_eq!(d.detect(&text, None).unwrap().radius, requested.min(10));
        }
        assert_eq!(d.extract_radius("radius 99999999999999999999"), 10);
    }

    #[test]
    fn test_trigger_gate() {
        let d = detector(&[("grass", "minecraft:grass_block")]);
        assert!(d.has_trigger("Please, clear chunk grass now"));
        assert!(!d.has_trigger("grass is nice"));
        assert!(!d.has_trigger("unclear chunky grass"));
        // Detection itself ignores the trigger
        assert!(d.detect("grass is nice", None).is_some());
    }

    #[test]
    fn test_bias_list_includes_trigger_words() {
        let d = detector(&[("stone", "minecraft:stone"), ("gold block", "minecraft:gold_block")]);
        let bias = d.bias_list();
        assert!(bias.contains(&"stone".to_string()));
        assert!(bias.contains(&"gold block".to_string()));
        assert!(bias.ends_with(&["clear".to_string(), "chunk".to_string()]));
    }

    #[test]
    fn test_block_id_normalization() {
        assert_eq!(normalize_block_id("stone").unwrap(), "minecraft:stone");
        assert_eq!(normalize_block_id("Minecraft:Gold_Block").unwrap(), "minecraft:gold_block");
        assert!(normalize_block_id("minecraft:not a block").is_err());
        assert!(normalize_block_id("").is_err());
    }

    #[test]
    fn test_vocabulary_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("block_words.json");

        let vocabulary = Vocabulary::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(vocabulary.len(), 5);
        assert_eq!(vocabulary.get("diamond block"), Some("minecraft:diamond_block"));
    }

    #[test]
    fn test_vocabulary_add_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.json");
        fs::write(&path, r#"{"grass": "minecraft:grass_block", "sand": "minecraft:sand"}"#).unwrap();

        let mut vocabulary = Vocabulary::load_or_create(&path).unwrap();
        let (phrase, block) = vocabulary.add("Oak Log!", "oak_log").unwrap();
        assert_eq!(phrase, "oak log");
        assert_eq!(block, "minecraft:oak_log");
        assert!(vocabulary.remove("SAND").unwrap());
        assert!(!vocabulary.remove("sand").unwrap());

        let reloaded = Vocabulary::load_or_create(&path).unwrap();
        let phrases: Vec<&str> = reloaded.entries().iter().map(|e| e.phrase.as_str()).collect();
        assert_eq!(phrases, vec!["grass", "oak log"]);
    }

    #[test]
    fn test_vocabulary_add_rejects_bad_block() {
        let mut vocabulary = Vocabulary::from_pairs([("stone", "minecraft:stone")]);
        assert!(vocabulary.add("weird", "minecraft:Not-Valid!").is_err());
        assert!(vocabulary.add("   ", "minecraft:stone").is_err());
        assert_eq!(vocabulary.len(), 1);
    }
}
