//! End-to-end tests of batch runs over the standard stage catalog.

#[cfg(test)]
mod tests {
    use crate::config::{ModelVariantConfig, PipelineConfig};
    use crate::core::{ArtifactStore, UnitId};
    use crate::events::{names, CollectingEventSink};
    use crate::pipeline::{LedgerStatus, RunLedger, RunState};
    use crate::runner::BatchRunner;
    use crate::foreground::section_header;
    use crate::testing::fixtures::{fasta, gard_report, single_model_report, site_model_report, write_unit_sources};
    use crate::testing::{assert_ledger_has, ScriptedToolRunner};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const SITE_MODELS: [(&str, u32, f64); 6] = [
        ("0", 2, -1000.0),
        ("1", 3, -995.0),
        ("2", 5, -990.0),
        ("3", 6, -989.5),
        ("7", 3, -994.0),
        ("8", 5, -988.0),
    ];

    fn config(dir: &TempDir, units: &[&str]) -> PipelineConfig {
        let input_dir = dir.path().join("input");
        write_unit_sources(&input_dir, units).unwrap();
        PipelineConfig {
            input_dir,
            work_dir: dir.path().join("work"),
            concurrency: Some(4),
            ..PipelineConfig::default()
        }
    }

    fn tools() -> ScriptedToolRunner {
        ScriptedToolRunner::new().with_output("ml_site", |_| site_model_report(&SITE_MODELS))
    }

    fn digests(store: &ArtifactStore, unit: &str) -> BTreeMap<String, String> {
        store
            .manifest(&UnitId::new(unit))
            .unwrap()
            .into_iter()
            .map(|(key, entry)| (key, entry.sha256))
            .collect()
    }

    #[tokio::test]
    async fn test_full_run_writes_report_and_ledger() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["ACE2", "BRCA1", "TP53"]);
        let tools = Arc::new(tools());
        let runner = BatchRunner::new(config).with_tool_runner(tools.clone());

        let outcome = runner.run().await.unwrap();

        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(
            outcome.run.units,
            vec![UnitId::new("ACE2"), UnitId::new("BRCA1"), UnitId::new("TP53")]
        );
        assert!(outcome.run.failed.is_empty());
        for stage in ["qc", "align", "trim", "mask", "tree", "ml_site"] {
            assert_eq!(tools.invocation_count(stage), 3, "stage {stage}");
        }

        // M0/M1, M1/M2, M0/M3 and M7/M8 per unit; no B or BS runs.
        let report = outcome.report.unwrap();
        assert_eq!(report.len(), 12);
        assert!(report
            .records
            .windows(2)
            .all(|w| w[0].adjusted_p_value <= w[1].adjusted_p_value));
        assert!(report.records.iter().all(|r| r.adjusted_p_value >= r.p_value));

        assert_eq!(outcome.report_paths.len(), 2);
        let tsv = fs::read_to_string(&outcome.report_paths[0]).unwrap();
        assert_eq!(tsv.lines().count(), 13);
        assert!(tsv.starts_with("unit\tpairing"));
        assert!(outcome.ledger_path.is_file());
        assert_eq!(outcome.ledger.total_units, 3);
        assert!(!outcome.ledger.has_failures());
    }

    #[tokio::test]
    async fn test_stage_barrier_orders_invocations() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B", "C", "D"]);
        let tools = Arc::new(tools().with_delay(Duration::from_millis(5)));
        let sink = Arc::new(CollectingEventSink::new());
        let runner = BatchRunner::new(config)
            .with_tool_runner(tools.clone())
            .with_event_sink(sink.clone());

        runner.run().await.unwrap();

        let order: Vec<String> = tools.invocations().into_iter().map(|(stage, _)| stage).collect();
        let stages = ["qc", "align", "trim", "mask", "tree", "ml_site"];
        for pair in stages.windows(2) {
            let last_before = order.iter().rposition(|s| s == pair[0]).unwrap();
            let first_after = order.iter().position(|s| s == pair[1]).unwrap();
            assert!(last_before < first_after, "{} overlapped {}", pair[0], pair[1]);
        }
        assert_eq!(sink.count(names::STAGE_STARTED), 6);
        assert_eq!(sink.count(names::UNIT_SUCCEEDED), 24);
        assert_eq!(sink.count(names::PIPELINE_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_unit_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B", "C"]);
        let tools = Arc::new(tools().fail_unit("align", "B", 1));
        let runner = BatchRunner::new(config).with_tool_runner(tools.clone());

        let outcome = runner.run().await.unwrap();

        assert!(outcome.run.is_completed());
        assert_eq!(outcome.run.units, vec![UnitId::new("A"), UnitId::new("C")]);
        assert_eq!(outcome.run.failed, vec![UnitId::new("B")]);
        assert!(!tools.was_invoked("trim", "B"));
        assert!(tools.was_invoked("ml_site", "A"));

        let report = outcome.report.unwrap();
        assert!(report.records.iter().all(|r| r.unit != UnitId::new("B")));
        assert_eq!(report.len(), 8);

        let entries = RunLedger::load(&outcome.ledger_path).unwrap();
        assert_ledger_has(&entries, "B", "align", LedgerStatus::Failed);
        assert_eq!(outcome.ledger.failed_units, 1);
    }

    #[tokio::test]
    async fn test_stage_failing_for_every_unit_aborts() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B"]);
        let tools = Arc::new(tools().fail_stage("tree", 1));
        let sink = Arc::new(CollectingEventSink::new());
        let runner = BatchRunner::new(config)
            .with_tool_runner(tools.clone())
            .with_event_sink(sink.clone());

        let outcome = runner.run().await.unwrap();

        assert!(matches!(
            outcome.run.state,
            RunState::Aborted { stage_index: 4, ref stage, .. } if stage == "tree"
        ));
        assert!(outcome.run.error().is_some());
        assert!(outcome.report.is_none());
        assert!(outcome.report_paths.is_empty());
        assert_eq!(tools.invocation_count("ml_site"), 0);
        assert_eq!(sink.count(names::PIPELINE_ABORTED), 1);
        assert_eq!(sink.count(names::PIPELINE_COMPLETED), 0);
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_stages() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B"]);
        let work_dir = config.work_dir.clone();

        let first = Arc::new(tools());
        BatchRunner::new(config.clone())
            .with_tool_runner(first.clone())
            .run()
            .await
            .unwrap();
        let store = ArtifactStore::new(fs::canonicalize(&work_dir).unwrap());
        let before = digests(&store, "A");
        assert_eq!(before.len(), 6);

        let second = Arc::new(tools());
        let outcome = BatchRunner::new(config)
            .with_tool_runner(second.clone())
            .run()
            .await
            .unwrap();

        assert!(outcome.run.is_completed());
        assert!(second.invocations().is_empty());
        assert_eq!(outcome.report.unwrap().len(), 8);
        assert_eq!(digests(&store, "A"), before);
    }

    #[tokio::test]
    async fn test_rerun_after_deleting_marker_repeats_only_that_stage() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B"]);

        BatchRunner::new(config.clone())
            .with_tool_runner(Arc::new(tools()))
            .run()
            .await
            .unwrap();
        let store = ArtifactStore::new(fs::canonicalize(&config.work_dir).unwrap());
        let before = digests(&store, "A");
        fs::remove_file(store.stage_dir(&UnitId::new("A"), "align").join("alignment.fas")).unwrap();

        let second = Arc::new(tools());
        BatchRunner::new(config)
            .with_tool_runner(second.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(second.invocations(), vec![("align".to_string(), UnitId::new("A"))]);
        assert_eq!(digests(&store, "A"), before);
    }

    #[tokio::test]
    async fn test_output_of_failed_attempt_is_rerun() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B"]);

        let first = BatchRunner::new(config.clone())
            .with_tool_runner(Arc::new(tools().fail_unit("align", "B", 1).with_partial_outputs_on_failure()))
            .run()
            .await
            .unwrap();
        assert_eq!(first.run.failed, vec![UnitId::new("B")]);
        let store = ArtifactStore::new(fs::canonicalize(&config.work_dir).unwrap());
        assert!(!store.stage_dir(&UnitId::new("B"), "align").join("alignment.fas").exists());

        let second = Arc::new(tools());
        let outcome = BatchRunner::new(config)
            .with_tool_runner(second.clone())
            .run()
            .await
            .unwrap();

        assert!(second.was_invoked("align", "B"));
        assert!(!second.was_invoked("align", "A"));
        assert_eq!(outcome.run.units, vec![UnitId::new("A"), UnitId::new("B")]);
        assert_eq!(outcome.report.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_branch_model_is_tested_per_foreground_lineage() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, &["A"]);
        config.models.push(
            ModelVariantConfig::new("branch")
                .with_model_label("B")
                .with_foreground()
                .with_override("model", "2"),
        );
        let tools = Arc::new(
            tools()
                .with_output("tree", |_| "((human|HS:0.1,mouse|MM:0.2):0.05,dog:0.3);\n".to_string())
                .with_output("ml_branch", |_| single_model_report(3, -996.0)),
        );

        let outcome = BatchRunner::new(config)
            .with_tool_runner(tools.clone())
            .run()
            .await
            .unwrap();

        assert!(outcome.run.is_completed());
        assert_eq!(tools.invocation_count("ml_branch"), 2);
        assert_eq!(tools.invocation_count("ml_site"), 1);

        let report = outcome.report.unwrap();
        assert_eq!(report.len(), 6);
        let mut lineages: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.pairing == "M0_vs_B")
            .map(|r| (r.foreground.clone().unwrap(), r.statistic))
            .collect();
        lineages.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(lineages, vec![("human|HS".to_string(), 8.0), ("mouse|MM".to_string(), 8.0)]);
        assert!(report
            .records
            .iter()
            .filter(|r| r.pairing != "M0_vs_B")
            .all(|r| r.foreground.is_none()));

        let store = ArtifactStore::new(fs::canonicalize(dir.path().join("work")).unwrap());
        let joined = fs::read_to_string(store.stage_dir(&UnitId::new("A"), "ml_branch").join("branch.out")).unwrap();
        assert!(joined.contains(&section_header("mouse|MM")));
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, &["A", "B", "C", "D", "E", "F"]);
        config.concurrency = Some(2);
        let tools = Arc::new(tools().with_delay(Duration::from_millis(20)));

        let outcome = BatchRunner::new(config)
            .with_tool_runner(tools.clone())
            .run()
            .await
            .unwrap();

        assert!(outcome.run.is_completed());
        assert!(tools.max_concurrent() <= 2);
        assert!(tools.max_concurrent() >= 1);
    }

    #[tokio::test]
    async fn test_recombination_partitions_units_into_blocks() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, &["A", "B"]);
        config.recombination = true;
        let alignment = fasta(&[
            ("human", "ATGGCTTCCAAAGGGCCC"),
            ("mouse", "ATGGCATCGAAAGGACCA"),
        ]);
        let tools = Arc::new(
            tools()
                .with_output("mask", move |_| alignment.clone())
                .with_output("breakpoints", |_| gard_report(6, &[(1, 3), (4, 6)])),
        );

        let outcome = BatchRunner::new(config)
            .with_tool_runner(tools.clone())
            .run()
            .await
            .unwrap();

        assert!(outcome.run.is_completed());
        let expected: Vec<UnitId> = ["A", "B"]
            .iter()
            .flat_map(|name| [UnitId::new(name).block(1), UnitId::new(name).block(2)])
            .collect();
        assert_eq!(outcome.run.units, expected);
        assert!(tools.was_invoked("tree", "A.b1"));
        assert!(!tools.was_invoked("tree", "A"));
        assert_eq!(tools.invocation_count("ml_site"), 4);
        assert_eq!(outcome.report.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_unreadable_report_is_excluded() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["A", "B"]);
        let tools = Arc::new(
            ScriptedToolRunner::new().with_output("ml_site", |unit| {
                if unit.name() == "B" {
                    "no likelihood here\n".to_string()
                } else {
                    site_model_report(&SITE_MODELS)
                }
            }),
        );

        let outcome = BatchRunner::new(config).with_tool_runner(tools).run().await.unwrap();

        assert!(outcome.run.is_completed());
        assert_eq!(outcome.report.unwrap().len(), 4);
        let entries = RunLedger::load(&outcome.ledger_path).unwrap();
        assert_ledger_has(&entries, "B", "extract", LedgerStatus::Excluded);
        assert_eq!(outcome.ledger.excluded_units, 1);
    }

    #[test]
    fn test_plan_lists_units_and_stages() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, &["B", "A"]);

        let plan = BatchRunner::new(config).plan().unwrap();

        assert_eq!(plan.units, vec![UnitId::new("A"), UnitId::new("B")]);
        assert_eq!(plan.stages, vec!["qc", "align", "trim", "mask", "tree", "ml_site"]);
    }
}
