//! Question Bank
//!
//! Loads question sources into an immutable index. Each source is a
//! partition with its own column mapping and priority. The index is rebuilt
//! wholesale on reload and swapped in atomically by the holder.

pub mod matcher;
pub mod source;

pub use matcher::{FuzzyMatcher, MatchCandidate, MatchResult};
pub use source::{BankError, Table};

use crate::config::BankSourceConfig;
use crate::error::PipelineError;
use crate::text::normalize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One question with its options and correct answer
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionEntry {
    /// Partition the entry came from
    pub source_id: String,
    /// Normalized question text (the lookup key)
    pub question_text: String,
    /// Question text as written in the source
    pub original_text: String,
    /// (label, text) in label order
    pub options: Vec<(String, String)>,
    /// Label of the correct option; always present in `options`
    pub correct_label: String,
    /// 1-based data row in the source
    pub row: usize,
}

impl QuestionEntry {
    /// Text of the correct option
    pub fn correct_text(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|(label, _)| *label == self.correct_label)
            .map(|(_, text)| text.as_str())
    }
}

/// Column mapping of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub question_column: String,
    pub option_columns: Vec<String>,
    pub option_labels: Vec<String>,
    pub answer_column: String,
}

impl ColumnMapping {
    pub fn from_config(source: &BankSourceConfig) -> Self {
        let configured = source.option_labels.clone().unwrap_or_default();
        let option_labels = (0..source.option_columns.len())
            .map(|i| configured.get(i).cloned().unwrap_or_else(|| default_label(i)))
            .collect();

        Self {
            question_column: source.question_column.clone(),
            option_columns: source.option_columns.clone(),
            option_labels,
            answer_column: source.answer_column.clone(),
        }
    }

    fn required_columns(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.question_column)
            .chain(self.option_columns.iter())
            .chain(std::iter::once(&self.answer_column))
    }
}

/// A, B, C, ... Z, then 27, 28, ...
pub fn default_label(i: usize) -> String {
    if i < 26 {
        char::from(b'A' + i as u8).to_string()
    } else {
        (i + 1).to_string()
    }
}

/// Loaded partition metadata
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: String,
    pub path: PathBuf,
    pub priority: i32,
    pub mapping: ColumnMapping,
}

/// Per-source load statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub id: String,
    pub priority: i32,
    /// Entries added to the index
    pub entries: usize,
    /// Rows without question text
    pub skipped_empty: usize,
    /// Rows whose correct answer matched no option
    pub skipped_invalid: usize,
}

/// Immutable question index
#[derive(Debug, Default)]
pub struct QuestionIndex {
    entries: Vec<QuestionEntry>,
    /// Partition index for every entry
    entry_partition: Vec<usize>,
    partitions: Vec<Partition>,
    exact: HashMap<String, usize>,
    stats: Vec<SourceStats>,
}

impl QuestionIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from partitions in load order.
    ///
    /// On duplicate question text the higher-priority partition wins the
    /// exact lookup; equal priority keeps the first loaded.
    pub fn from_partitions(partitions: Vec<(Partition, Vec<QuestionEntry>, SourceStats)>) -> Self {
        let mut index = Self::default();

        for (partition, entries, stats) in partitions {
            let p = index.partitions.len();
            let priority = partition.priority;
            index.partitions.push(partition);
            index.stats.push(stats);

            for entry in entries {
                let i = index.entries.len();
                let replace = match index.exact.get(&entry.question_text) {
                    Some(&existing) => index.priority(existing) < priority,
                    None => true,
                };
                if replace {
                    index.exact.insert(entry.question_text.clone(), i);
                }
                index.entries.push(entry);
                index.entry_partition.push(p);
            }
        }

        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QuestionEntry] {
        &self.entries
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn stats(&self) -> &[SourceStats] {
        &self.stats
    }

    /// Priority of the partition holding entry `i`
    pub fn priority(&self, i: usize) -> i32 {
        self.entry_partition
            .get(i)
            .and_then(|&p| self.partitions.get(p))
            .map(|p| p.priority)
            .unwrap_or(i32::MIN)
    }

    /// Entry position for an exact normalized question text
    pub fn lookup_exact_index(&self, normalized: &str) -> Option<usize> {
        self.exact.get(normalized).copied()
    }

    pub fn lookup_exact(&self, normalized: &str) -> Option<&QuestionEntry> {
        self.lookup_exact_index(normalized).map(|i| &self.entries[i])
    }
}

/// Outcome of loading all configured sources
#[derive(Debug, Default)]
pub struct LoadReport {
    pub total_sources: usize,
    /// (source id, reason) for every skipped source
    pub failures: Vec<(String, String)>,
}

impl LoadReport {
    /// `BankLoadPartialFailure` when any source was skipped
    pub fn partial_failure(&self) -> Option<PipelineError> {
        (!self.failures.is_empty()).then(|| PipelineError::BankLoadPartialFailure {
            failed: self.failures.len(),
            total: self.total_sources,
        })
    }
}

pub struct LoadedBank {
    pub index: QuestionIndex,
    pub report: LoadReport,
}

/// Load every source, skipping (with a warning) those that cannot be read.
/// Relative paths resolve against `base_dir` when given.
pub fn load(sources: &[BankSourceConfig], base_dir: Option<&Path>) -> LoadedBank {
    let mut partitions = Vec::new();
    let mut report = LoadReport {
        total_sources: sources.len(),
        failures: Vec::new(),
    };

    for source in sources {
        match load_source(source, base_dir) {
            Ok(loaded) => {
                info!(
                    "Loaded source '{}': {} questions ({} empty, {} invalid rows skipped)",
                    source.id, loaded.2.entries, loaded.2.skipped_empty, loaded.2.skipped_invalid
                );
                partitions.push(loaded);
            }
            Err(e) => {
                warn!("Skipping question source '{}': {}", source.id, e);
                report.failures.push((source.id.clone(), e.to_string()));
            }
        }
    }

    let index = QuestionIndex::from_partitions(partitions);
    if let Some(err) = report.partial_failure() {
        warn!("{}", err);
    }
    info!("Question bank ready: {} entries", index.len());

    LoadedBank { index, report }
}

fn resolve_path(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Read one source into entries
pub fn load_source(
    source: &BankSourceConfig,
    base_dir: Option<&Path>,
) -> Result<(Partition, Vec<QuestionEntry>, SourceStats), BankError> {
    let path = resolve_path(&source.path, base_dir);
    let format = source::detect_format(&path, source.format)?;
    let table = source::read_table(&path, format)?;
    let mapping = ColumnMapping::from_config(source);

    let missing: Vec<String> = mapping
        .required_columns()
        .filter(|c| table.column(c).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BankError::MissingColumns {
            source_id: source.id.clone(),
            columns: missing,
        });
    }

    let (entries, mut stats) = build_entries(&source.id, source.priority, &table, &mapping);
    stats.skipped_invalid += table.malformed_rows;

    Ok((
        Partition {
            id: source.id.clone(),
            path,
            priority: source.priority,
            mapping,
        },
        entries,
        stats,
    ))
}

/// Convert table rows to entries. Column presence must be checked first.
fn build_entries(
    source_id: &str,
    priority: i32,
    table: &Table,
    mapping: &ColumnMapping,
) -> (Vec<QuestionEntry>, SourceStats) {
    let mut stats = SourceStats {
        id: source_id.to_string(),
        priority,
        ..Default::default()
    };
    let mut entries = Vec::new();

    let (Some(question_col), Some(answer_col)) = (
        table.column(&mapping.question_column),
        table.column(&mapping.answer_column),
    ) else {
        return (entries, stats);
    };
    let option_cols: Vec<(usize, &String)> = mapping
        .option_columns
        .iter()
        .zip(mapping.option_labels.iter())
        .filter_map(|(col, label)| table.column(col).map(|i| (i, label)))
        .collect();

    for (i, row) in table.rows.iter().enumerate() {
        let row_number = table.row_number(i);
        let original = table.cell(row, question_col);
        let question_text = normalize(original);
        if question_text.is_empty() {
            stats.skipped_empty += 1;
            continue;
        }

        let options: Vec<(String, String)> = option_cols
            .iter()
            .filter_map(|&(col, label)| {
                let text = table.cell(row, col);
                (!text.is_empty()).then(|| (label.clone(), text.to_string()))
            })
            .collect();

        let answer = table.cell(row, answer_col);
        let Some(correct_label) = resolve_answer(answer, &options) else {
            warn!(
                "Source '{}' row {}: answer '{}' matches no option, skipping",
                source_id, row_number, answer
            );
            stats.skipped_invalid += 1;
            continue;
        };

        entries.push(QuestionEntry {
            source_id: source_id.to_string(),
            question_text,
            original_text: original.to_string(),
            options,
            correct_label,
            row: row_number,
        });
    }

    stats.entries = entries.len();
    (entries, stats)
}

/// Resolve a correct-answer cell to an option label.
///
/// Accepts a label (case-insensitive, full-width folded) or the exact text
/// of one option.
pub fn resolve_answer(answer: &str, options: &[(String, String)]) -> Option<String> {
    let wanted = normalize(answer);
    if wanted.is_empty() {
        return None;
    }

    if let Some((label, _)) = options
        .iter()
        .find(|(label, _)| normalize(label).to_lowercase() == wanted.to_lowercase())
    {
        return Some(label.clone());
    }

    options
        .iter()
        .find(|(_, text)| normalize(text) == wanted)
        .map(|(label, _)| label.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn entry(source: &str, question: &str, options: &[(&str, &str)], answer: &str) -> QuestionEntry {
        QuestionEntry {
            source_id: source.to_string(),
            question_text: normalize(question),
            original_text: question.to_string(),
            options: options
                .iter()
                .map(|(l, t)| (l.to_string(), t.to_string()))
                .collect(),
            correct_label: answer.to_string(),
            row: 1,
        }
    }

    pub(crate) fn partition(id: &str, priority: i32) -> Partition {
        Partition {
            id: id.to_string(),
            path: PathBuf::from(format!("{}.csv", id)),
            priority,
            mapping: ColumnMapping {
                question_column: "question".to_string(),
                option_columns: vec!["a".to_string(), "b".to_string()],
                option_labels: vec!["A".to_string(), "B".to_string()],
                answer_column: "answer".to_string(),
            },
        }
    }

    pub(crate) fn index_of(parts: Vec<(&str, i32, Vec<QuestionEntry>)>) -> QuestionIndex {
        QuestionIndex::from_partitions(
            parts
                .into_iter()
                .map(|(id, priority, entries)| {
                    let stats = SourceStats {
                        id: id.to_string(),
                        priority,
                        entries: entries.len(),
                        ..Default::default()
                    };
                    (partition(id, priority), entries, stats)
                })
                .collect(),
        )
    }

    fn source_config(id: &str, path: &Path, priority: i32) -> BankSourceConfig {
        BankSourceConfig {
            id: id.to_string(),
            path: path.to_path_buf(),
            format: None,
            priority,
            question_column: "question".to_string(),
            option_columns: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            option_labels: None,
            answer_column: "answer".to_string(),
        }
    }

    fn csv_file(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::with_suffix(".csv").unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_csv_source() {
        let f = csv_file(
            "question,a,b,c,answer\n\
             1+1=,1,2,3,B\n\
             ,x,y,z,A\n\
             首都は？,東京,大阪,京都,東京\n\
             broken,1,2,3,Z\n\
             lower,p,q,r,c\n",
        );
        let loaded = load(&[source_config("math", f.path(), 0)], None);
        let index = loaded.index;

        assert_eq!(index.len(), 3);
        assert!(loaded.report.partial_failure().is_none());

        let e = index.lookup_exact("1+1=").unwrap();
        assert_eq!(e.correct_label, "B");
        assert_eq!(e.correct_text(), Some("2"));
        assert_eq!(e.row, 1);

        // Answer given as option text resolves to its label
        let capital = index.lookup_exact("首都は？").unwrap();
        assert_eq!(capital.correct_label, "A");

        // Lowercase label accepted
        assert_eq!(index.lookup_exact("lower").unwrap().correct_label, "C");

        let stats = &index.stats()[0];
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.skipped_empty, 1);
        assert_eq!(stats.skipped_invalid, 1);
    }

    #[test]
    fn test_undecodable_row_counted_not_fatal() {
        let mut f = NamedTempFile::with_suffix(".csv").unwrap();
        f.write_all(
            b"question,a,b,c,answer\n\
              q1,1,2,3,A\n\
              q2 \xff\xfe,1,2,3,B\n\
              q3,1,2,3,C\n\
              q4,1,2,3,A\n",
        )
        .unwrap();
        let loaded = load(&[source_config("mixed", f.path(), 0)], None);

        assert!(loaded.report.partial_failure().is_none());
        let index = loaded.index;
        assert_eq!(index.len(), 3);
        assert_eq!(index.lookup_exact("q3").unwrap().row, 3);

        let stats = &index.stats()[0];
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.skipped_invalid, 1);
    }

    #[test]
    fn test_question_text_is_normalized() {
        let f = csv_file("question,a,b,c,answer\n1 + 1 ＝,1,2,3,B\n");
        let index = load(&[source_config("math", f.path(), 0)], None).index;

        let e = index.lookup_exact("1+1=").unwrap();
        assert_eq!(e.original_text, "1 + 1 ＝");
    }

    #[test]
    fn test_missing_columns_skips_source() {
        let good = csv_file("question,a,b,c,answer\nq1,1,2,3,A\n");
        let bad = csv_file("question,a,answer\nq2,1,A\n");

        let loaded = load(
            &[
                source_config("good", good.path(), 0),
                source_config("bad", bad.path(), 0),
                source_config("gone", Path::new("/nonexistent/bank.csv"), 0),
            ],
            None,
        );

        assert_eq!(loaded.index.len(), 1);
        assert_eq!(loaded.report.failures.len(), 2);
        assert!(matches!(
            loaded.report.partial_failure(),
            Some(PipelineError::BankLoadPartialFailure { failed: 2, total: 3 })
        ));
    }

    #[test]
    fn test_relative_path_resolves_against_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bank.csv"), "question,a,b,c,answer\nq,1,2,3,A\n").unwrap();

        let loaded = load(&[source_config("rel", Path::new("bank.csv"), 0)], Some(dir.path()));
        assert_eq!(loaded.index.len(), 1);
    }

    #[test]
    fn test_load_json_source() {
        let mut f = NamedTempFile::with_suffix(".json").unwrap();
        f.write_all(
            r#"[{"question": "2×3=", "a": "5", "b": 6, "c": "7", "answer": "b"}]"#.as_bytes(),
        )
        .unwrap();

        let index = load(&[source_config("json", f.path(), 0)], None).index;
        let e = index.lookup_exact("2×3=").unwrap();
        assert_eq!(e.correct_label, "B");
        assert_eq!(e.correct_text(), Some("6"));
    }

    #[test]
    fn test_custom_option_labels() {
        let f = csv_file("question,a,b,c,answer\nq,x,y,z,ロ\n");
        let mut cfg = source_config("kana", f.path(), 0);
        cfg.option_labels = Some(vec!["イ".to_string(), "ロ".to_string()]);

        let index = load(&[cfg], None).index;
        let e = index.lookup_exact("q").unwrap();
        assert_eq!(e.correct_label, "ロ");
        // Third column falls back to the default label
        assert_eq!(e.options[2].0, "C");
    }

    #[test]
    fn test_exact_lookup_prefers_priority() {
        let index = index_of(vec![
            ("low", 0, vec![entry("low", "同じ問題", &[("A", "x"), ("B", "y")], "A")]),
            ("high", 5, vec![entry("high", "同じ問題", &[("A", "x"), ("B", "y")], "B")]),
        ]);
        assert_eq!(index.lookup_exact("同じ問題").unwrap().source_id, "high");
    }

    #[test]
    fn test_exact_lookup_equal_priority_keeps_first() {
        let index = index_of(vec![
            ("first", 1, vec![entry("first", "q", &[("A", "x")], "A")]),
            ("second", 1, vec![entry("second", "q", &[("A", "x")], "A")]),
        ]);
        assert_eq!(index.lookup_exact("q").unwrap().source_id, "first");
    }

    #[test]
    fn test_resolve_answer() {
        let options = vec![
            ("A".to_string(), "りんご".to_string()),
            ("B".to_string(), "みかん".to_string()),
        ];
        assert_eq!(resolve_answer("b", &options), Some("B".to_string()));
        assert_eq!(resolve_answer("Ｂ", &options), Some("B".to_string()));
        assert_eq!(resolve_answer("りんご", &options), Some("A".to_string()));
        assert_eq!(resolve_answer("ぶどう", &options), None);
        assert_eq!(resolve_answer("", &options), None);
    }

    #[test]
    fn test_default_labels() {
        assert_eq!(default_label(0), "A");
        assert_eq!(default_label(25), "Z");
        assert_eq!(default_label(26), "27");
    }
}
