//! Foreground lineage selection for branch and branch-site models.
//!
//! Tree labels that contain `|` name lineages (`human|HS`). For each lineage
//! a copy of the tree is made with that label alone marked `#1`, the branch
//! the branch models test against the background. A foreground stage runs
//! its tool once per copy and joins the reports into one artifact, each
//! report introduced by a [`section_header`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static LINEAGE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^,:();#\s]*\|[^,:();#\s]*").expect("static regex is valid"));

/// Newick mark of the foreground branch.
pub const FOREGROUND_MARK: &str = "#1";

const SECTION_PREFIX: &str = "==> foreground ";
const SECTION_SUFFIX: &str = " <==";

/// A tree with one lineage marked as foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundTree {
    /// 1-based position in lineage order.
    pub index: usize,
    /// The marked label.
    pub lineage: String,
    /// The marked tree.
    pub newick: String,
}

impl ForegroundTree {
    /// Directory, under the stage directory, of this lineage's run.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("fg{}", self.index)
    }
}

/// Returns one marked tree per distinct `|`-labelled lineage, sorted by label.
///
/// Marks already present in `newick` are cleared first. A tree without
/// such labels yields nothing.
#[must_use]
pub fn foreground_trees(newick: &str) -> Vec<ForegroundTree> {
    let clean = newick.trim().replace(FOREGROUND_MARK, "");
    let lineages: BTreeSet<&str> = LINEAGE_LABEL
        .find_iter(&clean)
        .map(|m| m.as_str())
        .filter(|label| *label != "|")
        .collect();
    lineages
        .into_iter()
        .enumerate()
        .map(|(i, lineage)| ForegroundTree {
            index: i + 1,
            lineage: lineage.to_string(),
            newick: mark(&clean, lineage),
        })
        .collect()
}

fn mark(newick: &str, lineage: &str) -> String {
    let mut marked = String::with_capacity(newick.len() + FOREGROUND_MARK.len());
    let mut last = 0;
    for label in LINEAGE_LABEL.find_iter(newick) {
        marked.push_str(&newick[last..label.end()]);
        if label.as_str() == lineage {
            marked.push_str(FOREGROUND_MARK);
        }
        last = label.end();
    }
    marked.push_str(&newick[last..]);
    marked
}

/// The line introducing one lineage's report in a joined report.
#[must_use]
pub fn section_header(lineage: &str) -> String {
    format!("{SECTION_PREFIX}{lineage}{SECTION_SUFFIX}")
}

/// Splits a joined report into `(lineage, report text)` sections.
///
/// Returns `None` for a plain report without section headers. Text before
/// the first header is ignored.
#[must_use]
pub fn split_sections(text: &str) -> Option<Vec<(String, String)>> {
    let mut sections: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let lineage = line
            .strip_prefix(SECTION_PREFIX)
            .and_then(|rest| rest.strip_suffix(SECTION_SUFFIX));
        match (lineage, sections.last_mut()) {
            (Some(lineage), _) => sections.push((lineage.to_string(), String::new())),
            (None, Some((_, body))) => {
                body.push_str(line);
                body.push('\n');
            }
            (None, None) => {}
        }
    }
    (!sections.is_empty()).then_some(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TREE: &str = "((human|HS:0.1,mouse|MM:0.2)90/95:0.05,dog|CF:0.3);\n";

    #[test]
    fn test_one_tree_per_lineage() {
        let trees = foreground_trees(TREE);
        let lineages: Vec<&str> = trees.iter().map(|t| t.lineage.as_str()).collect();
        assert_eq!(lineages, vec!["dog|CF", "human|HS", "mouse|MM"]);
        assert_eq!(trees[1].newick, "((human|HS#1:0.1,mouse|MM:0.2)90/95:0.05,dog|CF:0.3);");
        assert_eq!(trees[1].dir_name(), "fg2");
        assert!(trees.iter().all(|t| t.newick.matches(FOREGROUND_MARK).count() == 1));
    }

    #[test]
    fn test_existing_marks_are_cleared() {
        let trees = foreground_trees("(a|x#1:0.1,b|y:0.2);");
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[1].newick, "(a|x:0.1,b|y#1:0.2);");
    }

    #[test]
    fn test_prefix_labels_are_marked_exactly() {
        let trees = foreground_trees("(ab|x:0.1,b|x:0.2);");
        let b = trees.iter().find(|t| t.lineage == "b|x").unwrap();
        assert_eq!(b.newick, "(ab|x:0.1,b|x#1:0.2);");
    }

    #[test]
    fn test_tree_without_lineage_labels() {
        assert!(foreground_trees("((a:0.1,b:0.2),c:0.3);").is_empty());
    }

    #[test]
    fn test_sections_split_back() {
        let joined = format!(
            "{}\nModel: one\nlnL = 1\n{}\nModel: two\n",
            section_header("human|HS"),
            section_header("mouse|MM")
        );
        let sections = split_sections(&joined).unwrap();
        assert_eq!(
            sections,
            vec![
                ("human|HS".to_string(), "Model: one\nlnL = 1\n".to_string()),
                ("mouse|MM".to_string(), "Model: two\n".to_string()),
            ]
        );
        assert!(split_sections("Model: plain\n").is_none());
    }
}
