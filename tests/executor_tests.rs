//! End-to-end runs through the executor, with writes landing at yield points.

use planstage_core::config::ExecConfig;
use planstage_core::types::{Document, Scalar};
use planstage_core::RecordRef;
use planstage_exec::{Engine, ExecError, ExecOutput, Mutation};
use planstage_operators::{
    AndHashStage, BoxedStage, CollectionScan, FieldPredicate, QueuedStage, QueuedStep, StageError,
};
use serde_json::json;

fn people(engine: &Engine) -> Vec<RecordRef> {
    let store = engine.store();
    (0..100)
        .map(|i| {
            store.insert(
                Document::new()
                    .with("id", i as i64)
                    .with("age", 20 + (i % 50) as i64)
                    .with("name", format!("Person{}", i)),
            )
        })
        .collect()
}

fn scan(engine: &Engine, expr: &str) -> BoxedStage {
    Box::new(CollectionScan::new(engine.context()).with_filter(FieldPredicate::parse(expr).unwrap()))
}

fn ids(outputs: &[ExecOutput]) -> Vec<i64> {
    let mut out: Vec<i64> = outputs
        .iter()
        .map(|o| match o.document.as_ref().and_then(|d| d.get("id")) {
            Some(Scalar::I64(id)) => *id,
            other => panic!("output without id: {:?}", other),
        })
        .collect();
    out.sort();
    out
}

#[test]
fn test_and_of_range_scans() {
    let engine = Engine::new(ExecConfig::default()).unwrap();
    people(&engine);

    let root = AndHashStage::new(
        engine.context(),
        vec![
            scan(&engine, "age >= 60"),
            scan(&engine, "id < 50"),
            scan(&engine, "age != 65"),
        ],
    );
    let summary = engine.executor(Box::new(root)).run_to_completion().unwrap();

    let expected: Vec<i64> = (0..50).filter(|i| 20 + i >= 60 && 20 + i != 65).collect();
    assert_eq!(ids(&summary.matched), expected);
    assert!(summary.flagged.is_empty());
    assert_eq!(engine.pool().borrow().live_count(), 0);
    assert!(summary.peak_candidates >= 10);
}

#[test]
fn test_explain_reports_rounds_and_summary() {
    let engine = Engine::new(ExecConfig::default()).unwrap();
    people(&engine);

    let root = AndHashStage::new(
        engine.context(),
        vec![scan(&engine, "age >= 60"), scan(&engine, "id < 50")],
    );
    let mut exec = engine.executor(Box::new(root));
    let summary = exec.run_to_completion().unwrap();

    let explain = exec.explain().unwrap();
    assert_eq!(explain["stage"], "and_hash");
    assert_eq!(explain["specific"]["kind"], "and_hash");
    assert_eq!(explain["specific"]["map_after_child"], json!([20, 10]));
    assert_eq!(explain["common"]["advanced"], 10);
    assert_eq!(explain["children"][0]["stage"], "collection_scan");
    assert_eq!(explain["children"][0]["specific"]["docs_examined"], 100);

    let summary = serde_json::to_value(&summary).unwrap();
    assert_eq!(summary["matched"].as_array().unwrap().len(), 10);
    assert_eq!(summary["flagged"], json!([]));
    // Twenty members plus one in-flight probe candidate.
    assert_eq!(summary["peak_candidates"], 21);
}

#[test]
fn test_config_from_json() {
    let cfg = ExecConfig::from_json_str(r#"{"yield_every_works": 3, "max_works": 10000}"#).unwrap();
    assert_eq!(cfg.yield_every_works, 3);
    assert_eq!(cfg.max_works, Some(10000));

    let engine = Engine::new(cfg).unwrap();
    people(&engine);
    let root = AndHashStage::new(
        engine.context(),
        vec![scan(&engine, "age == 30"), scan(&engine, "id >= 0")],
    );
    let summary = engine.executor(Box::new(root)).run_to_completion().unwrap();
    assert_eq!(ids(&summary.matched), vec![10, 60]);
    assert!(summary.yields > 0);
}

#[test]
fn test_relocated_member_is_flagged_with_old_document() {
    let cfg = ExecConfig {
        yield_every_works: 2,
        ..ExecConfig::default()
    };
    let engine = Engine::new(cfg).unwrap();
    let locs = people(&engine);

    let root = AndHashStage::new(
        engine.context(),
        vec![
            Box::new(QueuedStage::records(engine.context(), locs[..4].to_vec())) as BoxedStage,
            scan(&engine, "id >= 0"),
        ],
    );
    let mut exec = engine.executor(Box::new(root));
    exec.queue_write(Mutation::Relocate(
        locs[0],
        Document::new().with("id", 1000i64),
    ));

    let summary = exec.run_to_completion().unwrap();
    assert_eq!(ids(&summary.matched), vec![1, 2, 3]);
    assert_eq!(ids(&summary.flagged), vec![0]);
    assert_eq!(engine.store().len(), 100);
    assert_eq!(exec.pending_writes(), 0);
}

#[test]
fn test_flagged_child_output_passes_through() {
    let engine = Engine::new(ExecConfig::default()).unwrap();
    let locs = people(&engine);

    let flagged_doc = Document::new().with("id", 7i64).with("age", 99i64);
    let root = AndHashStage::new(
        engine.context(),
        vec![
            Box::new(QueuedStage::records(engine.context(), locs[..3].to_vec())) as BoxedStage,
            Box::new(QueuedStage::new(
                engine.context(),
                vec![
                    QueuedStep::Record(locs[1]),
                    QueuedStep::Flagged(flagged_doc.clone()),
                    QueuedStep::Record(locs[2]),
                ],
            )),
        ],
    )
    .with_predicate(FieldPredicate::parse("age < 50").unwrap());

    let summary = engine.executor(Box::new(root)).run_to_completion().unwrap();
    assert_eq!(ids(&summary.matched), vec![1, 2]);
    assert_eq!(summary.flagged.len(), 1);
    assert_eq!(summary.flagged[0].document.as_ref(), Some(&flagged_doc));
}

#[test]
fn test_child_failure_reports_child_index() {
    let engine = Engine::new(ExecConfig::default()).unwrap();
    let locs = people(&engine);

    let root = AndHashStage::new(
        engine.context(),
        vec![
            Box::new(QueuedStage::records(engine.context(), locs[..5].to_vec())) as BoxedStage,
            Box::new(QueuedStage::records(engine.context(), locs[..5].to_vec())),
            Box::new(QueuedStage::new(
                engine.context(),
                vec![QueuedStep::Record(locs[0]), QueuedStep::Fail("disk gone".into())],
            )),
        ],
    );
    let err = engine
        .executor(Box::new(root))
        .run_to_completion()
        .unwrap_err();

    match err {
        ExecError::Stage(StageError::Child { child, source }) => {
            assert_eq!(child, 2);
            assert!(matches!(*source, StageError::Exec(ref m) if m == "disk gone"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.pool().borrow().live_count(), 0);
}

#[test]
fn test_try_new_rejects_single_child() {
    let engine = Engine::new(ExecConfig::default()).unwrap();
    let only = scan(&engine, "id >= 0");
    let err = AndHashStage::try_new(engine.context(), vec![only]).err().unwrap();
    assert!(matches!(err, StageError::Precondition(_)));
}
