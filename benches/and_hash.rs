use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion};
use planstage_core::types::Document;
use planstage_core::RecordRef;
use planstage_mem::{CandidatePool, MemoryRecordStore};
use planstage_operators::{AndHashStage, BoxedStage, QueuedStage, Stage, StageContext, StageState};

fn make_store(rows: usize) -> (Rc<MemoryRecordStore>, Vec<RecordRef>) {
    let store = Rc::new(MemoryRecordStore::new());
    let locs = (0..rows)
        .map(|i| store.insert(Document::new().with("n", i as i64)))
        .collect();
    (store, locs)
}

fn bench_and_hash(c: &mut Criterion) {
    let (store, locs) = make_store(16 * 1024);
    // Every other record, every third record, every fifth record.
    let strided = |step: usize| -> Vec<RecordRef> { locs.iter().copied().step_by(step).collect() };
    let inputs = [strided(2), strided(3), strided(5)];

    c.bench_function("and_hash_3way_16k", |b| {
        b.iter(|| {
            let ctx = StageContext::new(CandidatePool::shared(1 << 16), store.clone());
            let children: Vec<BoxedStage> = inputs
                .iter()
                .map(|locs| {
                    Box::new(QueuedStage::records(ctx.clone(), locs.iter().copied())) as BoxedStage
                })
                .collect();
            let mut stage = AndHashStage::new(ctx.clone(), children);

            let mut matched = 0usize;
            loop {
                match stage.work() {
                    StageState::Advanced(t) => {
                        matched += 1;
                        ctx.release(t).unwrap();
                    }
                    StageState::NeedTime => {}
                    StageState::Exhausted => break,
                    StageState::Failed(e) => panic!("{e}"),
                }
            }
            matched
        })
    });
}

criterion_group!(and_hash, bench_and_hash);
criterion_main!(and_hash);
