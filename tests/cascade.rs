mod common;

use common::Engine;
use flagshift::error::Error;
use flagshift::store::Store;
use flagshift::types::{FlagScope, FlagStatus};

#[tokio::test]
async fn deactivation_propagates_transitively() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Inactive, &[]);
    let b = engine.add_flag("b", FlagStatus::Active, &["a"]);
    let c = engine.add_flag("c", FlagStatus::Active, &["b"]);
    let unrelated = engine.add_flag("unrelated", FlagStatus::Active, &[]);

    let report = engine
        .cascade
        .cascade(&a, FlagStatus::Inactive)
        .await
        .expect("cascade");

    assert_eq!(report.deactivated, vec![b.id.clone(), c.id.clone()]);
    assert_eq!(engine.status(&b), FlagStatus::Inactive);
    assert_eq!(engine.status(&c), FlagStatus::Inactive);
    assert_eq!(engine.status(&unrelated), FlagStatus::Active);
    assert_eq!(engine.cache.invalidated_flag_ids(), vec![b.id, c.id]);
}

#[tokio::test]
async fn activation_requires_every_dependency() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Inactive, &[]);
    let b = engine.add_flag("b", FlagStatus::Inactive, &[]);
    let d = engine.add_flag("d", FlagStatus::Inactive, &["a", "b"]);

    engine
        .store
        .transition_flag_status(&a.id, FlagStatus::Inactive, FlagStatus::Active, chrono::Utc::now())
        .expect("activate a");
    let report = engine
        .cascade
        .cascade(&engine.flag(&a.id), FlagStatus::Active)
        .await
        .expect("cascade from a");
    assert!(report.activated.is_empty());
    assert_eq!(engine.status(&d), FlagStatus::Inactive);

    engine
        .store
        .transition_flag_status(&b.id, FlagStatus::Inactive, FlagStatus::Active, chrono::Utc::now())
        .expect("activate b");
    let report = engine
        .cascade
        .cascade(&engine.flag(&b.id), FlagStatus::Active)
        .await
        .expect("cascade from b");
    assert_eq!(report.activated, vec![d.id.clone()]);
    assert_eq!(engine.status(&d), FlagStatus::Active);
}

#[tokio::test]
async fn activation_propagates_through_levels() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Active, &[]);
    let b = engine.add_flag("b", FlagStatus::Inactive, &["a"]);
    let c = engine.add_flag("c", FlagStatus::Inactive, &["b"]);

    let report = engine
        .cascade
        .cascade(&a, FlagStatus::Active)
        .await
        .expect("cascade");

    assert_eq!(report.activated, vec![b.id.clone(), c.id.clone()]);
    assert_eq!(engine.status(&c), FlagStatus::Active);
}

#[tokio::test]
async fn archived_flags_never_participate() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Inactive, &[]);
    let archived = engine.add_flag("archived", FlagStatus::Archived, &["a"]);
    let behind_archived = engine.add_flag("behind", FlagStatus::Active, &["archived"]);

    let report = engine
        .cascade
        .cascade(&a, FlagStatus::Inactive)
        .await
        .expect("cascade");

    assert!(report.is_empty());
    assert_eq!(engine.status(&archived), FlagStatus::Archived);
    assert_eq!(engine.status(&behind_archived), FlagStatus::Active);

    // An archived source does nothing either.
    let report = engine
        .cascade
        .cascade(&engine.flag(&archived.id), FlagStatus::Inactive)
        .await
        .expect("cascade from archived");
    assert!(report.is_empty());
    assert_eq!(engine.status(&behind_archived), FlagStatus::Active);
}

#[tokio::test]
async fn archived_dependency_blocks_activation() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Active, &[]);
    engine.add_flag("gone", FlagStatus::Archived, &[]);
    let d = engine.add_flag("d", FlagStatus::Inactive, &["a", "gone"]);

    let report = engine
        .cascade
        .cascade(&a, FlagStatus::Active)
        .await
        .expect("cascade");
    assert!(report.activated.is_empty());
    assert_eq!(engine.status(&d), FlagStatus::Inactive);
}

#[tokio::test]
async fn dependency_cycle_terminates() {
    let engine = Engine::new();
    let x = engine.add_flag("x", FlagStatus::Inactive, &["z"]);
    let y = engine.add_flag("y", FlagStatus::Active, &["x"]);
    let z = engine.add_flag("z", FlagStatus::Active, &["y"]);

    let report = engine
        .cascade
        .cascade(&x, FlagStatus::Inactive)
        .await
        .expect("cascade");

    assert_eq!(report.deactivated, vec![y.id.clone(), z.id.clone()]);
    assert_eq!(engine.status(&x), FlagStatus::Inactive);
}

#[tokio::test]
async fn cascade_stays_within_scope() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Inactive, &[]);

    let mut other = common::flag("b", FlagStatus::Active, &["a"]);
    other.scope = FlagScope::Organization("org-1".to_string());
    engine.store.create_flag(&other).expect("create flag");

    let report = engine
        .cascade
        .cascade(&a, FlagStatus::Inactive)
        .await
        .expect("cascade");
    assert!(report.is_empty());
    assert_eq!(engine.status(&other), FlagStatus::Active);
}

#[tokio::test]
async fn store_failure_surfaces_as_cascade_error() {
    let engine = Engine::new();
    let a = engine.add_flag("a", FlagStatus::Inactive, &[]);
    engine.add_flag("b", FlagStatus::Active, &["a"]);

    engine
        .store
        .connection()
        .execute_batch("DROP TABLE flags")
        .expect("drop flags table");

    let err = engine
        .cascade
        .cascade(&a, FlagStatus::Inactive)
        .await
        .expect_err("cascade must fail");
    assert!(matches!(err, Error::Cascade { ref flag_id, .. } if *flag_id == a.id));
}
