//! Control-file rendering for likelihood tools.
//!
//! A control file is a list of `key = value` lines. Rendering starts from a
//! template and rewrites the lines for each overridden key; keys the template
//! lacks are appended.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Built-in template used when no control template is configured.
pub const DEFAULT_CONTROL_TEMPLATE: &str = "\
      seqfile = seqfile.fas
     treefile = tree.treefile
      outfile = mlc

        noisy = 0
      verbose = 1
      runmode = 0

      seqtype = 1
    CodonFreq = 7
        clock = 0
       aaDist = 0

        model = 0
      NSsites = 0

    cleandata = 1
    fix_kappa = 0
        kappa = 2
    fix_omega = 0
        omega = 0.4
    fix_alpha = 1
        alpha = 0
       Malpha = 0
        ncatG = 8

        getSE = 0
 RateAncestor = 0
       method = 0
";

/// How one stage's control file is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSpec {
    /// Template text.
    pub template: String,
    /// Per-stage key overrides (e.g. `model`, `NSsites`, `fix_omega`).
    pub overrides: BTreeMap<String, String>,
}

impl ControlSpec {
    /// Creates a spec from template text.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            overrides: BTreeMap::new(),
        }
    }

    /// Adds a key override.
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Renders the control file with the stage overrides plus the per-unit
    /// file bindings (`seqfile`, `treefile`, `outfile`).
    #[must_use]
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> String {
        let mut merged = self.overrides.clone();
        merged.extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        render_control(&self.template, &merged)
    }
}

/// Rewrites `key = value` lines of `template`; unmatched keys are appended.
#[must_use]
pub fn render_control(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut text = template.to_string();
    for (key, value) in values {
        let pattern = format!(r"(?m)^[ \t]*{}[ \t]*=.*$", regex::escape(key));
        let line = format!("{key} = {value}");
        match Regex::new(&pattern) {
            Ok(re) if re.is_match(&text) => {
                text = re.replace_all(&text, regex::NoExpand(&line)).into_owned();
            }
            _ => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&line);
                text.push('\n');
            }
        }
    }
    text
}

/// Reads the value of `key` from rendered control text.
#[must_use]
pub fn control_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.split('*').next().unwrap_or(v).trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_replaces_existing_keys() {
        let text = render_control(DEFAULT_CONTROL_TEMPLATE, &values(&[("model", "2"), ("NSsites", "2")]));
        assert_eq!(control_value(&text, "model"), Some("2"));
        assert_eq!(control_value(&text, "NSsites"), Some("2"));
        assert_eq!(control_value(&text, "CodonFreq"), Some("7"));
    }

    #[test]
    fn test_appends_missing_keys() {
        let text = render_control("model = 0\n", &values(&[("fix_blength", "1")]));
        assert_eq!(text, "model = 0\nfix_blength = 1\n");
    }

    #[test]
    fn test_key_match_is_whole_key() {
        // Overriding `omega` must not touch `fix_omega`.
        let text = render_control("fix_omega = 0\nomega = 0.4\n", &values(&[("omega", "1")]));
        assert_eq!(text, "fix_omega = 0\nomega = 1\n");
    }

    #[test]
    fn test_spec_bindings_override_stage_values() {
        let spec = ControlSpec::new(DEFAULT_CONTROL_TEMPLATE)
            .with_override("model", "2")
            .with_override("outfile", "ignored");
        let text = spec.render(&values(&[("outfile", "branch_site.out"), ("seqfile", "trimmed.fas")]));
        assert_eq!(control_value(&text, "outfile"), Some("branch_site.out"));
        assert_eq!(control_value(&text, "seqfile"), Some("trimmed.fas"));
        assert_eq!(control_value(&text, "model"), Some("2"));
    }

    #[test]
    fn test_control_value_strips_comments() {
        assert_eq!(control_value("NSsites = 0 1 2 * site models\n", "NSsites"), Some("0 1 2"));
    }
}
