//! Recombination partitioning.
//!
//! A breakpoint report (GARD JSON) lists non-recombinant segments as codon
//! ranges under `breakpointData.<k>.bps`. Each segment becomes its own block
//! unit: the alignment columns are sliced out, trimmed inward to whole
//! codons, checked for stop codons and written as FASTA.

use crate::core::{ArtifactStore, UnitId};
use crate::errors::PartitionError;
use bio::io::fasta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Directory (under a unit) holding block files.
pub const PARTITION_DIR: &str = "partition";

const STOP_CODONS: [&[u8; 3]; 3] = [b"TAA", b"TAG", b"TGA"];

/// Planned slice of the alignment for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlan {
    /// 1-based block index, in ascending range order.
    pub index: u32,
    /// Codon range from the report.
    pub codon_start: i64,
    /// Codon range end from the report.
    pub codon_end: i64,
    /// 1-based inclusive nucleotide start after codon trimming.
    pub start: usize,
    /// 1-based inclusive nucleotide end after codon trimming.
    pub end: usize,
}

impl BlockPlan {
    /// Length in nucleotides.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    /// True if shorter than one codon.
    #[must_use]
    pub const fn is_too_short(&self) -> bool {
        self.len() < 3
    }
}

/// What happened to a planned block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fate", rename_all = "snake_case")]
pub enum BlockFate {
    /// Written and usable as a unit.
    Kept {
        /// The block unit.
        unit: UnitId,
        /// The block alignment.
        path: PathBuf,
    },
    /// Written for audit but rejected.
    Discarded {
        /// Where the rejected block was written.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },
    /// Shorter than one codon after trimming; nothing written.
    TooShort,
}

/// A planned block and its fate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedBlock {
    /// The slice.
    pub plan: BlockPlan,
    /// The outcome.
    pub fate: BlockFate,
}

/// Reads the sorted, de-duplicated codon ranges from a report.
#[must_use]
pub fn read_codon_ranges(report: &Value) -> Vec<(i64, i64)> {
    let Some(data) = report.get("breakpointData").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut keys: Vec<(i64, &Value)> = data
        .iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|n| (n, v)))
        .collect();
    keys.sort_by_key(|(n, _)| *n);

    let mut ranges = BTreeSet::new();
    for (_, segment) in keys {
        let Some(bps) = segment.get("bps").and_then(Value::as_array) else {
            continue;
        };
        for range in bps {
            let Some(pair) = range.as_array().filter(|pair| pair.len() == 2) else {
                continue;
            };
            if let (Some(start), Some(end)) = (as_int(&pair[0]), as_int(&pair[1])) {
                if start <= end {
                    ranges.insert((start, end));
                }
            }
        }
    }
    ranges.into_iter().collect()
}

fn as_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// Infers nucleotides per report site (3 for codon data, otherwise 1).
#[must_use]
pub fn infer_scale(alignment_len: usize, report: &Value) -> usize {
    let sites = report
        .get("input")
        .and_then(|input| input.get("number of sites"))
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok());
    match sites {
        Some(n) if n > 0 && alignment_len % n == 0 => alignment_len / n,
        _ => 1,
    }
}

/// Moves `start` up and `end` down to whole-codon boundaries, clamped to the alignment.
#[must_use]
pub fn adjust_to_codon_boundaries(start: i64, end: i64, alignment_len: usize) -> (usize, usize) {
    let len = i64::try_from(alignment_len).unwrap_or(i64::MAX).max(1);
    let mut start = start;
    let mut end = end;
    let offset = (start - 1).rem_euclid(3);
    if offset != 0 {
        start += 3 - offset;
    }
    end -= end.rem_euclid(3);
    let clamp = |n: i64| usize::try_from(n.clamp(1, len)).unwrap_or(1);
    (clamp(start), clamp(end))
}

/// Plans blocks for an alignment of `alignment_len` columns.
///
/// Ranges that collapse (`start > end`) after codon trimming, or whose
/// nucleotide bounds overflow, are dropped without consuming an index.
#[must_use]
pub fn plan_blocks(report: &Value, alignment_len: usize) -> Vec<BlockPlan> {
    let scale = i64::try_from(infer_scale(alignment_len, report)).unwrap_or(1);
    let mut index = 0;
    read_codon_ranges(report)
        .into_iter()
        .filter_map(|(codon_start, codon_end)| {
            let nucleotide_start = codon_start.checked_sub(1)?.checked_mul(scale)?.checked_add(1)?;
            let nucleotide_end = codon_end.checked_mul(scale)?;
            let (start, end) = adjust_to_codon_boundaries(nucleotide_start, nucleotide_end, alignment_len);
            if start > end {
                return None;
            }
            index += 1;
            Some(BlockPlan {
                index,
                codon_start,
                codon_end,
                start,
                end,
            })
        })
        .collect()
}

/// Checks a block: whole codons and no stop codon in any record.
///
/// # Errors
///
/// Returns the rejection reason.
pub fn check_block(records: &[fasta::Record]) -> Result<(), String> {
    let Some(first) = records.first() else {
        return Err("empty alignment".to_string());
    };
    let len = first.seq().len();
    if len % 3 != 0 {
        return Err(format!("length {len} not divisible by 3"));
    }
    for record in records {
        let has_stop = record
            .seq()
            .chunks_exact(3)
            .any(|codon| STOP_CODONS.iter().any(|stop| codon.eq_ignore_ascii_case(*stop)));
        if has_stop {
            return Err(format!("stop codon found in {}", record.id()));
        }
    }
    Ok(())
}

fn read_alignment(path: &Path) -> Result<Vec<fasta::Record>, PartitionError> {
    let reader = fasta::Reader::new(File::open(path)?);
    let records = reader.records().collect::<Result<Vec<_>, _>>().map_err(|e| PartitionError::BadAlignment {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let Some(first) = records.first() else {
        return Err(PartitionError::BadAlignment {
            path: path.to_path_buf(),
            message: "no sequences".to_string(),
        });
    };
    let len = first.seq().len();
    if let Some(ragged) = records.iter().find(|r| r.seq().len() != len) {
        return Err(PartitionError::BadAlignment {
            path: path.to_path_buf(),
            message: format!("record '{}' has length {} but expected {len}", ragged.id(), ragged.seq().len()),
        });
    }
    Ok(records)
}

fn write_records(path: &Path, records: &[fasta::Record]) -> Result<(), PartitionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = fasta::Writer::new(File::create(path)?);
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Splits `parent`'s alignment into blocks as described by `report`.
///
/// Kept blocks are written into each block unit's own directory; rejected
/// blocks go to the parent's `partition/discarded` directory.
///
/// # Errors
///
/// Returns [`PartitionError`] if the report or alignment is unusable or
/// no block survives planning.
pub fn partition_unit(
    store: &ArtifactStore,
    parent: &UnitId,
    alignment: &Path,
    report: &Path,
) -> Result<Vec<PartitionedBlock>, PartitionError> {
    let records = read_alignment(alignment)?;
    let alignment_len = records.first().map_or(0, |r| r.seq().len());

    let text = fs::read_to_string(report)?;
    let json: Value = serde_json::from_str(&text).map_err(|e| PartitionError::MalformedReport {
        path: report.to_path_buf(),
        message: e.to_string(),
    })?;
    let plans = plan_blocks(&json, alignment_len);
    if plans.is_empty() {
        return Err(PartitionError::MalformedReport {
            path: report.to_path_buf(),
            message: "no usable blocks in breakpointData".to_string(),
        });
    }

    let mut blocks = Vec::with_capacity(plans.len());
    for plan in plans {
        if plan.is_too_short() {
            tracing::debug!(unit = %parent, block = plan.index, "Block shorter than one codon, skipped");
            blocks.push(PartitionedBlock {
                plan,
                fate: BlockFate::TooShort,
            });
            continue;
        }

        let sliced: Vec<fasta::Record> = records
            .iter()
            .map(|r| fasta::Record::with_attrs(r.id(), r.desc(), &r.seq()[plan.start - 1..plan.end]))
            .collect();
        let file_name = format!(
            "{}.gard_block{}_{}-{}.fas",
            parent.name(),
            plan.index,
            plan.codon_start,
            plan.codon_end
        );

        let fate = match check_block(&sliced) {
            Ok(()) => {
                let unit = parent.block(plan.index);
                let path = store.unit_dir(&unit).join(PARTITION_DIR).join(&file_name);
                write_records(&path, &sliced)?;
                BlockFate::Kept { unit, path }
            }
            Err(reason) => {
                let path = store
                    .unit_dir(parent)
                    .join(PARTITION_DIR)
                    .join("discarded")
                    .join(&file_name);
                write_records(&path, &sliced)?;
                BlockFate::Discarded { path, reason }
            }
        };
        blocks.push(PartitionedBlock { plan, fate });
    }
    Ok(blocks)
}
