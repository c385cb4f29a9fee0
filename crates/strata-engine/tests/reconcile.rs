//! End-to-end reconciliation passes against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use strata_core::{
    register_provider, ApplyRequest, Kind, Phase, Provider, ResourceId, StateRecord, StateStore,
    Status, StrataError, StrataResult, Value,
};
use strata_engine::{AppConfig, Application, Input};
use strata_store::MemoryStoreFactory;

/// Provider that persists full lifecycle records and logs deletions.
struct RecordingProvider {
    kind: Kind,
    applies: Arc<AtomicUsize>,
    deletes: Arc<parking_lot::Mutex<Vec<ResourceId>>>,
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn apply(&self, req: ApplyRequest<'_>) -> StrataResult<Value> {
        self.applies.fetch_add(1, Ordering::SeqCst);

        let record = match req.store.get(req.id).await? {
            Some(prev) => prev.updating(req.deps.to_vec(), req.inputs.clone()),
            None => StateRecord::creating(
                self.kind.clone(),
                req.id.clone(),
                req.fqn.to_string(),
                req.deps.to_vec(),
                req.inputs.clone(),
            ),
        };

        let mut map = std::collections::BTreeMap::new();
        map.insert("fqn".to_string(), Value::from(req.fqn));
        map.insert("seq".to_string(), Value::from(record.seq));
        map.insert("inputs".to_string(), req.inputs.clone());
        let output = Value::Map(map);

        let record = record.settled(output.clone());
        req.store.set(req.id, &record).await?;
        Ok(output)
    }

    async fn delete(&self, record: &StateRecord, _store: &dyn StateStore) -> StrataResult<()> {
        self.deletes.lock().push(record.id.clone());
        Ok(())
    }
}

struct Handles {
    applies: Arc<AtomicUsize>,
    deletes: Arc<parking_lot::Mutex<Vec<ResourceId>>>,
}

fn recording(kind: &str) -> Handles {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let applies = Arc::new(AtomicUsize::new(0));
    let deletes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    register_provider(
        kind,
        Arc::new(RecordingProvider {
            kind: Kind::new(kind),
            applies: applies.clone(),
            deletes: deletes.clone(),
        }),
    );
    Handles { applies, deletes }
}

fn app(name: &str, factory: &Arc<MemoryStoreFactory>) -> Application {
    Application::new(
        AppConfig::new(name, "dev"),
        Arc::clone(factory) as Arc<dyn strata_core::StoreFactory>,
    )
}

#[tokio::test]
async fn test_single_resource_pass_persists_marker_and_record() {
    let handles = recording("reconcile::single");
    let factory = Arc::new(MemoryStoreFactory::new());

    let db_kind = "reconcile::single";
    app("single", &factory)
        .run(|ctx| async move {
            ctx.resource("db", db_kind, Input::map_of([("size", Input::from(10i64))]))?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(handles.applies.load(Ordering::SeqCst), 1);

    let partition = factory.partition(&strata_core::ScopeChain::root("single").child("dev"));
    assert_eq!(partition.count().await.unwrap(), 2); // marker + db

    let record = partition.get(&ResourceId::new("db")).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Created);
    assert_eq!(record.fqn, "single/dev/db");
    assert_eq!(record.seq, 0);
    assert_eq!(record.props.get("size"), Some(&Value::from(10i64)));

    let marker = partition.get(&ResourceId::scope_marker()).await.unwrap();
    assert!(marker.is_some());
}

#[tokio::test]
async fn test_second_pass_updates_in_place() {
    recording("reconcile::update");
    let factory = Arc::new(MemoryStoreFactory::new());

    for size in [10i64, 20i64] {
        app("update", &factory)
            .run(|ctx| async move {
                ctx.resource(
                    "db",
                    "reconcile::update",
                    Input::map_of([("size", Input::from(size))]),
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    let partition = factory.partition(&strata_core::ScopeChain::root("update").child("dev"));
    let record = partition.get(&ResourceId::new("db")).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Updated);
    assert_eq!(record.seq, 1);
    assert_eq!(record.props.get("size"), Some(&Value::from(20i64)));
    assert_eq!(record.old_props, None);
}

#[tokio::test]
async fn test_diamond_dependency_applies_once() {
    let handles = recording("reconcile::diamond");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("diamond", &factory)
        .run(|ctx| async move {
            let base = ctx.resource("base", "reconcile::diamond", Input::from("seed"))?;
            // Two consumers of the same upstream node.
            ctx.resource(
                "left",
                "reconcile::diamond",
                Input::map_of([("up", base.field("fqn").into())]),
            )?;
            ctx.resource(
                "right",
                "reconcile::diamond",
                Input::map_of([("up", base.field("fqn").into())]),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(handles.applies.load(Ordering::SeqCst), 3);

    let partition = factory.partition(&strata_core::ScopeChain::root("diamond").child("dev"));
    let left = partition.get(&ResourceId::new("left")).await.unwrap().unwrap();
    let right = partition.get(&ResourceId::new("right")).await.unwrap().unwrap();
    assert_eq!(left.props.get("up"), Some(&Value::from("diamond/dev/base")));
    assert_eq!(left.props.get("up"), right.props.get("up"));
    assert_eq!(left.deps, vec![ResourceId::new("base")]);
}

#[tokio::test]
async fn test_removed_resources_prune_dependents_first() {
    let handles = recording("reconcile::prune");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("prune", &factory)
        .run(|ctx| async move {
            let net = ctx.resource("net", "reconcile::prune", Input::from("10.0.0.0/8"))?;
            ctx.resource(
                "vm",
                "reconcile::prune",
                Input::map_of([("net", net.output())]),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    // Next pass declares nothing; both records are orphans.
    app("prune", &factory)
        .run(|_ctx| async move { Ok(()) })
        .await
        .unwrap();

    assert_eq!(
        handles.deletes.lock().clone(),
        vec![ResourceId::new("vm"), ResourceId::new("net")]
    );

    let partition = factory.partition(&strata_core::ScopeChain::root("prune").child("dev"));
    assert_eq!(partition.count().await.unwrap(), 1); // marker only
}

#[tokio::test]
async fn test_unchanged_graph_prunes_nothing() {
    let handles = recording("reconcile::stable");
    let factory = Arc::new(MemoryStoreFactory::new());

    for _ in 0..2 {
        app("stable", &factory)
            .run(|ctx| async move {
                ctx.resource("db", "reconcile::stable", Input::from("cfg"))?;
                Ok(())
            })
            .await
            .unwrap();
    }

    assert!(handles.deletes.lock().is_empty());
    assert_eq!(handles.applies.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_apply_never_prunes() {
    struct FailingProvider;

    #[async_trait]
    impl Provider for FailingProvider {
        async fn apply(&self, _req: ApplyRequest<'_>) -> StrataResult<Value> {
            Err(StrataError::Store("backend down".into()))
        }

        async fn delete(&self, _record: &StateRecord, _store: &dyn StateStore) -> StrataResult<()> {
            Ok(())
        }
    }

    let handles = recording("reconcile::failsafe");
    register_provider("reconcile::failsafe-broken", Arc::new(FailingProvider));
    let factory = Arc::new(MemoryStoreFactory::new());

    app("failsafe", &factory)
        .run(|ctx| async move {
            ctx.resource("db", "reconcile::failsafe", Input::from("cfg"))?;
            Ok(())
        })
        .await
        .unwrap();

    // This pass drops "db" from the graph but also fails partway; the
    // orphan must survive for the next healthy pass.
    let err = app("failsafe", &factory)
        .run(|ctx| async move {
            ctx.resource("other", "reconcile::failsafe-broken", Input::from("x"))?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::ProviderApply { .. }));

    assert!(handles.deletes.lock().is_empty());
    let partition = factory.partition(&strata_core::ScopeChain::root("failsafe").child("dev"));
    assert!(partition.get(&ResourceId::new("db")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_destroy_pass_empties_every_partition() {
    let handles = recording("reconcile::destroy");
    let factory = Arc::new(MemoryStoreFactory::new());

    let program = |ctx: strata_engine::PassContext| async move {
        ctx.resource("db", "reconcile::destroy", Input::from("root-level"))?;
        ctx.scope("workers", |ctx| async move {
            ctx.resource("pool", "reconcile::destroy", Input::from("4"))?;
            Ok(())
        })
        .await
    };

    app("teardown", &factory).run(program).await.unwrap();

    let root_chain = strata_core::ScopeChain::root("teardown").child("dev");
    let child_chain = root_chain.child("workers");
    assert_eq!(factory.partition(&root_chain).count().await.unwrap(), 2);
    assert_eq!(factory.partition(&child_chain).count().await.unwrap(), 2);

    // Same program, destroy phase: nothing is applied, everything is
    // orphaned, markers included.
    let destroyer = Application::new(
        AppConfig::new("teardown", "dev").phase(Phase::Destroy),
        factory.clone() as Arc<dyn strata_core::StoreFactory>,
    );
    destroyer.run(program).await.unwrap();

    assert_eq!(factory.partition(&root_chain).count().await.unwrap(), 0);
    assert_eq!(factory.partition(&child_chain).count().await.unwrap(), 0);
    let deleted = handles.deletes.lock().clone();
    assert!(deleted.contains(&ResourceId::new("db")));
    assert!(deleted.contains(&ResourceId::new("pool")));
}

#[tokio::test]
async fn test_parent_resource_used_in_child_scope_applies_once() {
    let parent = recording("reconcile::cross-parent");
    let child = recording("reconcile::cross-child");
    let factory = Arc::new(MemoryStoreFactory::new());

    let program = |ctx: strata_engine::PassContext| async move {
        let db = ctx.resource("db", "reconcile::cross-parent", Input::from("root"))?;
        let upstream = db.output();
        ctx.scope("api", |ctx| async move {
            // Reference the parent's resource from inside the child, then
            // declare a child resource under the same id.
            ctx.apply(upstream).await?;
            ctx.resource("db", "reconcile::cross-child", Input::from("leaf"))?;
            Ok(())
        })
        .await
    };

    app("cross", &factory).run(program).await.unwrap();

    // The child's apply and the parent's pass-end auto-apply joined the
    // same in-flight future; each resource ran exactly once.
    assert_eq!(parent.applies.load(Ordering::SeqCst), 1);
    assert_eq!(child.applies.load(Ordering::SeqCst), 1);

    let root_chain = strata_core::ScopeChain::root("cross").child("dev");
    let root_db = factory
        .partition(&root_chain)
        .get(&ResourceId::new("db"))
        .await
        .unwrap()
        .unwrap();
    let child_db = factory
        .partition(&root_chain.child("api"))
        .get(&ResourceId::new("db"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root_db.kind, Kind::new("reconcile::cross-parent"));
    assert_eq!(child_db.kind, Kind::new("reconcile::cross-child"));

    // An identical second pass touches both records; neither is orphaned.
    app("cross", &factory).run(program).await.unwrap();
    assert!(parent.deletes.lock().is_empty());
    assert!(child.deletes.lock().is_empty());
}

#[tokio::test]
async fn test_deferred_field_records_dependency_edge() {
    recording("reconcile::deferred");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("deferred", &factory)
        .run(|ctx| async move {
            let net = ctx.resource("net", "reconcile::deferred", Input::from("10.0.0.0/8"))?;
            let endpoint = net
                .field("fqn")
                .map(|v| Input::from(format!("https://{}", v.as_str().unwrap_or_default())));
            ctx.resource(
                "svc",
                "reconcile::deferred",
                Input::map_of([("endpoint", endpoint.into())]),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let partition = factory.partition(&strata_core::ScopeChain::root("deferred").child("dev"));
    let svc = partition.get(&ResourceId::new("svc")).await.unwrap().unwrap();
    assert_eq!(svc.deps, vec![ResourceId::new("net")]);
    assert_eq!(
        svc.props.get("endpoint"),
        Some(&Value::from("https://deferred/dev/net"))
    );
}

#[tokio::test]
async fn test_replacement_flushes_at_pass_end() {
    let handles = recording("reconcile::replace");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("replace", &factory)
        .run(|ctx| async move {
            ctx.resource("db-v1", "reconcile::replace", Input::from("old"))?;
            Ok(())
        })
        .await
        .unwrap();

    let partition = factory.partition(&strata_core::ScopeChain::root("replace").child("dev"));
    let old = partition.get(&ResourceId::new("db-v1")).await.unwrap().unwrap();

    // Create-before-delete: the successor applies first, the old record
    // is deleted only once the whole pass has settled.
    app("replace", &factory)
        .run(|ctx| async move {
            ctx.resource("db-v2", "reconcile::replace", Input::from("new"))?;
            ctx.defer_replacement(old);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(handles.deletes.lock().clone(), vec![ResourceId::new("db-v1")]);
    assert!(partition.get(&ResourceId::new("db-v1")).await.unwrap().is_none());
    assert!(partition.get(&ResourceId::new("db-v2")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stage_root_replacement_waits_for_application_end() {
    let handles = recording("reconcile::stage");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("staged", &factory)
        .run(|ctx| async move {
            ctx.stage("prod", |ctx| async move {
                ctx.resource("db-v1", "reconcile::stage", Input::from("old"))?;
                Ok(())
            })
            .await
        })
        .await
        .unwrap();

    let chain = strata_core::ScopeChain::root("staged").child("dev").child("prod");
    let old = factory
        .partition(&chain)
        .get(&ResourceId::new("db-v1"))
        .await
        .unwrap()
        .unwrap();

    app("staged", &factory)
        .run(|ctx| async move {
            ctx.stage("prod", |ctx| async move {
                ctx.resource("db-v2", "reconcile::stage", Input::from("new"))?;
                ctx.defer_replacement(old);
                Ok(())
            })
            .await
        })
        .await
        .unwrap();

    // The stage scope was force-finalized by the application, flushing the
    // queued replacement after the rest of the pass settled.
    assert_eq!(handles.deletes.lock().clone(), vec![ResourceId::new("db-v1")]);
    let partition = factory.partition(&chain);
    assert!(partition.get(&ResourceId::new("db-v1")).await.unwrap().is_none());
    assert!(partition.get(&ResourceId::new("db-v2")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_deferred_task_runs_during_finalize() {
    recording("reconcile::defer");
    let factory = Arc::new(MemoryStoreFactory::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_in = ran.clone();
    app("deferred-task", &factory)
        .run(|ctx| async move {
            let ran = ran_in.clone();
            let mut handle = ctx.defer(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            // Not yet: finalization has not happened.
            assert_eq!(handle.try_result(), Err(StrataError::NotFinalized));
            assert_eq!(ran_in.load(Ordering::SeqCst), 0);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scope_metadata_is_shared_within_a_pass() {
    recording("reconcile::meta");
    let factory = Arc::new(MemoryStoreFactory::new());

    app("meta", &factory)
        .run(|ctx| async move {
            // Root metadata is rejected outright.
            assert_eq!(
                ctx.set("region", "eu-west-1").await,
                Err(StrataError::RootScopeState)
            );

            ctx.scope("net", |ctx| async move {
                ctx.set("region", "eu-west-1").await?;
                assert_eq!(
                    ctx.get("region").await?,
                    Some(Value::from("eu-west-1"))
                );
                assert!(ctx.delete("region").await?);
                assert!(!ctx.delete("region").await?);
                Ok(())
            })
            .await
        })
        .await
        .unwrap();
}
