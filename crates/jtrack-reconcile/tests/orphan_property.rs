//! Orphan detection over randomly generated parent/child id sets.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use jtrack_core::{EntityType, Record, RecordId};
use jtrack_reconcile::classify::{find_orphans, ChildLink};
use jtrack_reconcile::{Category, ReconcileConfig, ReconcileRequest, Reconciler, RepairPolicy};
use jtrack_storage::InMemoryGateway;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Case {
    parents: HashSet<RecordId>,
    children: Vec<ChildLink>,
    dangling: BTreeSet<RecordId>,
}

fn generate(seed: u64) -> Case {
    let mut rng = StdRng::seed_from_u64(seed);
    let parents = (1..=40)
        .filter(|_| rng.random_bool(0.6))
        .collect::<HashSet<RecordId>>();
    let live = parents.iter().copied().collect::<Vec<_>>();

    let mut children = Vec::new();
    let mut dangling = BTreeSet::new();
    for id in 1000..1000 + rng.random_range(0..80) {
        let roll = rng.random_range(0..10);
        let foreign_key = if roll == 0 {
            None
        } else if roll < 3 || live.is_empty() {
            Some(rng.random_range(41..200))
        } else {
            Some(live[rng.random_range(0..live.len())])
        };
        if foreign_key.map_or(true, |fk| !parents.contains(&fk)) {
            dangling.insert(id);
        }
        children.push(ChildLink { id, foreign_key });
    }
    Case {
        parents,
        children,
        dangling,
    }
}

#[test]
fn orphans_are_exactly_the_injected_dangling_references() {
    for seed in 0..200 {
        let case = generate(seed);
        let found = find_orphans(&case.children, &case.parents)
            .into_iter()
            .collect::<BTreeSet<_>>();
        assert_eq!(found, case.dangling, "seed {seed}");
    }
}

#[tokio::test]
async fn orphan_pass_removes_only_dangling_matches() {
    for seed in [3, 17, 42, 99] {
        let case = generate(seed);
        let gateway = Arc::new(InMemoryGateway::job_tracker());
        gateway
            .seed_all(
                EntityType::Job,
                case.parents
                    .iter()
                    .map(|id| Record::new(*id).with("title", format!("Job {id}"))),
            )
            .await;
        gateway
            .seed_all(
                EntityType::Match,
                case.children
                    .iter()
                    .map(|child| Record::new(child.id).with("job_id", child.foreign_key)),
            )
            .await;
        let before = gateway.ids(EntityType::Match).await;

        let result = Reconciler::new(gateway.clone(), ReconcileConfig::default())
            .run(ReconcileRequest::new(Category::Orphans, RepairPolicy::AutoRepair))
            .await;

        assert!(result.error.is_none(), "seed {seed}: {:?}", result.error);
        let unit = result.summary.unit("orphaned matches.job_id").expect("unit");
        assert_eq!(unit.found, case.dangling.len(), "seed {seed}");
        let after = gateway.ids(EntityType::Match).await;
        assert_eq!(
            before.difference(&after).copied().collect::<BTreeSet<_>>(),
            case.dangling,
            "seed {seed}"
        );
    }
}
