use ctxstore_core::{
    ConflictPolicy, Context, EntityKind, Model, Persistence, PersistenceConfig, Record, RecordId,
    RecordValidationError, SerializationMode, StoreError,
};

fn open_ephemeral() -> Persistence {
    let model = Model::new("Docs", 1).with_kind(EntityKind::new("Doc").require("title"));
    Persistence::open(PersistenceConfig::ephemeral(model)).unwrap()
}

fn add_root(persistence: &Persistence, policy: ConflictPolicy) -> Context {
    persistence
        .add_context(SerializationMode::PrivateQueue, policy)
        .unwrap()
}

fn doc_id() -> RecordId {
    RecordId::parse("d1").unwrap()
}

/// Seeds `d1` through a third context so both contenders start clean.
fn seed(persistence: &Persistence) {
    let seeder = add_root(persistence, ConflictPolicy::Error);
    seeder
        .insert(
            Record::with_id(doc_id(), "Doc")
                .with("title", "draft")
                .with("body", "original"),
        )
        .unwrap();
    seeder.save().unwrap();
    persistence.remove_context(&seeder);
}

/// `local` edits `field` and holds it unsaved while `remote` saves `title`.
fn race(persistence: &Persistence, local: &Context, field: &str, value: &str) {
    let remote = add_root(persistence, ConflictPolicy::Error);

    let mut mine = local.find(&doc_id()).unwrap().unwrap();
    mine.set(field, value);
    local.update(mine).unwrap();

    let mut theirs = remote.find(&doc_id()).unwrap().unwrap();
    theirs.set("title", "remote");
    remote.update(theirs).unwrap();
    remote.save().unwrap();
    local.drain();
}

#[test]
fn error_policy_rejects_stale_save() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::Error);
    race(&persistence, &local, "title", "local");

    match local.save() {
        Err(StoreError::Conflict(ids)) => assert_eq!(ids, vec![doc_id()]),
        other => panic!("expected conflict, got {other:?}"),
    }
    let stored = persistence.store().fetch_record(&doc_id()).unwrap().unwrap();
    assert_eq!(stored.get("title").unwrap(), "remote");
    assert!(local.has_changes().unwrap());
}

#[test]
fn store_wins_keeps_untouched_local_fields() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::StoreWins);
    race(&persistence, &local, "body", "local body");

    let merged = local.find(&doc_id()).unwrap().unwrap();
    assert_eq!(merged.get("title").unwrap(), "remote");
    assert_eq!(merged.get("body").unwrap(), "local body");

    local.save().unwrap();
    let stored = persistence.store().fetch_record(&doc_id()).unwrap().unwrap();
    assert_eq!(stored.get("title").unwrap(), "remote");
    assert_eq!(stored.get("body").unwrap(), "local body");
}

#[test]
fn store_wins_drops_local_edit_of_same_field() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::StoreWins);
    race(&persistence, &local, "title", "local");

    let merged = local.find(&doc_id()).unwrap().unwrap();
    assert_eq!(merged.get("title").unwrap(), "remote");
    assert!(!local.has_changes().unwrap());
}

#[test]
fn context_wins_overrides_merged_values() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::ContextWins);
    race(&persistence, &local, "title", "local");

    let merged = local.find(&doc_id()).unwrap().unwrap();
    assert_eq!(merged.get("title").unwrap(), "local");

    local.save().unwrap();
    let stored = persistence.store().fetch_record(&doc_id()).unwrap().unwrap();
    assert_eq!(stored.get("title").unwrap(), "local");
    assert_eq!(stored.get("body").unwrap(), "original");
    assert_eq!(stored.version(), 3);
}

/// Like `race`, but `local` is removed first so the remote save is never
/// merged into it and the conflict surfaces at commit time.
fn unmerged_race(persistence: &Persistence, local: &Context) {
    let mut mine = local.find(&doc_id()).unwrap().unwrap();
    mine.set("title", "local");
    local.update(mine).unwrap();
    persistence.remove_context(local);

    let remote = add_root(persistence, ConflictPolicy::Error);
    let mut theirs = remote.find(&doc_id()).unwrap().unwrap();
    theirs.set("body", "remote body");
    remote.update(theirs).unwrap();
    remote.save().unwrap();
    local.drain();
}

#[test]
fn context_wins_resolves_conflict_at_commit() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::ContextWins);
    unmerged_race(&persistence, &local);

    local.save().unwrap();
    let stored = persistence.store().fetch_record(&doc_id()).unwrap().unwrap();
    assert_eq!(stored.get("title").unwrap(), "local");
    assert_eq!(stored.get("body").unwrap(), "remote body");
}

#[test]
fn store_wins_discards_stale_update_at_commit() {
    let persistence = open_ephemeral();
    seed(&persistence);
    let local = add_root(&persistence, ConflictPolicy::StoreWins);
    unmerged_race(&persistence, &local);

    local.save().unwrap();
    assert!(!local.has_changes().unwrap());
    let stored = persistence.store().fetch_record(&doc_id()).unwrap().unwrap();
    assert_eq!(stored.get("title").unwrap(), "draft");
    let cached = local.find(&doc_id()).unwrap().unwrap();
    assert_eq!(cached.get("body").unwrap(), "remote body");
}

#[test]
fn missing_required_field_fails_validation() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence, ConflictPolicy::Error);
    context
        .insert(Record::with_id(doc_id(), "Doc").with("body", "no title"))
        .unwrap();

    match persistence.save(&context) {
        Err(StoreError::Validation(RecordValidationError::MissingField { field, .. })) => {
            assert_eq!(field, "title")
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(context.has_changes().unwrap());
}

#[test]
fn update_of_unknown_record_is_not_found() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence, ConflictPolicy::Error);
    let result = context.update(Record::with_id(doc_id(), "Doc").with("title", "ghost"));
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}
