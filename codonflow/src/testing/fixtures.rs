//! Report, alignment and input-tree fixtures.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A codeml-style report of an `NSsites` batch run.
///
/// Each entry is `(model number, np, lnL)`.
#[must_use]
pub fn site_model_report(models: &[(&str, u32, f64)]) -> String {
    let mut text = String::from(
        "CODONML (in paml version 4.10.7, June 2023)  trimmed.fas\n\
         Codon frequency model: F3x4\n\
         ns =   4  ls = 120\n\n\
         NSsites batch run (ncatG as in YN2000):   0   1   2   3   7   8\n",
    );
    for (number, np, lnl) in models {
        let _ = write!(
            text,
            "\nModel {number}: site model {number}\n\n\
             TREE #  1:  (1, 2, (3, 4));   MP score: -1\n\
             lnL(ntime:  5  np: {np}):  {lnl:.6}      +0.000000\n\
             kappa (ts/tv) =  2.10000\n"
        );
    }
    text
}

/// A codeml-style report of a single unnumbered model.
#[must_use]
pub fn single_model_report(np: u32, lnl: f64) -> String {
    format!(
        "CODONML (in paml version 4.10.7, June 2023)  trimmed.fas\n\
         Model: several dN/dS ratios for branches\n\
         Codon frequency model: F3x4\n\n\
         TREE #  1:  (1, 2, (3, 4) #1);   MP score: -1\n\
         lnL(ntime:  5  np: {np}):  {lnl:.6}      +0.000000\n"
    )
}

/// A GARD-style breakpoint report with one set of codon ranges.
#[must_use]
pub fn gard_report(sites: usize, ranges: &[(i64, i64)]) -> String {
    let bps: Vec<serde_json::Value> = ranges.iter().map(|(s, e)| serde_json::json!([s, e])).collect();
    serde_json::json!({
        "input": {"number of sequences": 2, "number of sites": sites},
        "breakpointData": {"0": {"bps": bps}},
    })
    .to_string()
}

/// Renders `(id, sequence)` records as FASTA.
#[must_use]
pub fn fasta(records: &[(&str, &str)]) -> String {
    records.iter().fold(String::new(), |mut out, (id, seq)| {
        let _ = writeln!(out, ">{id}\n{seq}");
        out
    })
}

/// Writes one small sequence file per unit name into `dir`.
pub fn write_unit_sources(dir: &Path, names: &[&str]) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    names
        .iter()
        .map(|name| {
            let path = dir.join(format!("{name}.fasta"));
            fs::write(&path, fasta(&[("human", "ATGGCTTCCAAA"), ("mouse", "ATGGCATCGAAA")]))?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fasta_fixture() {
        assert_eq!(fasta(&[("a", "ATG"), ("b", "ATA")]), ">a\nATG\n>b\nATA\n");
    }

    #[test]
    fn test_gard_fixture_is_json() {
        let value: serde_json::Value = serde_json::from_str(&gard_report(30, &[(1, 5), (6, 10)])).unwrap();
        assert_eq!(value["breakpointData"]["0"]["bps"][1][0], 6);
    }
}
