use ctxstore_core::observe::{ChangeKind, LiveQuery, LiveQueryController, Registration};
use ctxstore_core::{
    collection, ConflictPolicy, Context, EntityKind, Model, ObserveError, Persistence,
    PersistenceConfig, Predicate, Query, Record, RecordId, SerializationMode,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

type Seen = Arc<Mutex<Vec<(ChangeKind, String)>>>;

fn open_ephemeral() -> Persistence {
    let model = Model::new("Tasks", 1)
        .with_kind(EntityKind::new("Task").require("title"))
        .with_kind(EntityKind::new("Tag"));
    Persistence::open(PersistenceConfig::ephemeral(model)).unwrap()
}

fn add_root(persistence: &Persistence) -> Context {
    persistence
        .add_context(SerializationMode::PrivateQueue, ConflictPolicy::Error)
        .unwrap()
}

fn task(id: &str, title: &str, rank: i64) -> Record {
    Record::with_id(RecordId::parse(id).unwrap(), "Task")
        .with("title", title)
        .with("rank", rank)
}

fn id(value: &str) -> RecordId {
    RecordId::parse(value).unwrap()
}

fn recorder(seen: &Seen) -> impl Fn(&LiveQuery, &ctxstore_core::ObjectChange) + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |_, change| {
        seen.lock()
            .push((change.kind, change.record.id().to_string()))
    }
}

fn seed(context: &Context, records: Vec<Record>) {
    for record in records {
        context.insert(record).unwrap();
    }
    context.save().unwrap();
}

#[test]
fn start_reports_every_match_as_insert() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    seed(
        &context,
        vec![task("t1", "one", 2), task("t2", "two", 1), task("t3", "three", 9)],
    );

    let query = LiveQuery::new(
        &context,
        Query::all("Task")
            .filter(Predicate::compare("rank", ctxstore_core::observe::CompareOp::Lt, 5))
            .sort_by("rank", true),
    );
    let controller = LiveQueryController::new(&context);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    context.drain();

    assert!(controller.is_started());
    assert_eq!(
        seen.lock().as_slice(),
        &[
            (ChangeKind::Insert, "t2".to_string()),
            (ChangeKind::Insert, "t1".to_string()),
        ]
    );
    let fetched: Vec<_> = query
        .fetched_records()
        .iter()
        .map(|record| record.id().to_string())
        .collect();
    assert_eq!(fetched, vec!["t2", "t1"]);
}

#[test]
fn sibling_saves_produce_transitions() {
    let persistence = open_ephemeral();
    let observed = add_root(&persistence);
    let writer = add_root(&persistence);
    seed(&writer, vec![task("t1", "one", 1), task("t2", "two", 2)]);
    observed.drain();

    let query = LiveQuery::new(&observed, Query::all("Task").sort_by("rank", true));
    let controller = LiveQueryController::new(&observed);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    observed.drain();
    seen.lock().clear();

    writer.insert(task("t3", "three", 3)).unwrap();
    let mut first = writer.find(&id("t1")).unwrap().unwrap();
    first.set("title", "first");
    writer.update(first).unwrap();
    writer.delete(&id("t2")).unwrap();
    writer.save().unwrap();
    observed.drain();

    let mut seen = seen.lock().clone();
    seen.sort_by(|left, right| left.1.cmp(&right.1));
    assert_eq!(
        seen,
        vec![
            (ChangeKind::Update, "t1".to_string()),
            (ChangeKind::Delete, "t2".to_string()),
            (ChangeKind::Insert, "t3".to_string()),
        ]
    );
}

#[test]
fn reordering_reports_move() {
    let persistence = open_ephemeral();
    let observed = add_root(&persistence);
    let writer = add_root(&persistence);
    seed(&writer, vec![task("t1", "one", 1), task("t2", "two", 2)]);
    observed.drain();

    let query = LiveQuery::new(&observed, Query::all("Task").sort_by("rank", true));
    let controller = LiveQueryController::new(&observed);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    observed.drain();
    seen.lock().clear();

    let mut second = writer.find(&id("t2")).unwrap().unwrap();
    second.set("rank", 0);
    writer.update(second).unwrap();
    writer.save().unwrap();
    observed.drain();

    let seen = seen.lock();
    assert!(seen.contains(&(ChangeKind::Update, "t2".to_string())));
    assert!(seen.contains(&(ChangeKind::Move, "t1".to_string())));
}

#[test]
fn in_flight_identities_are_suppressed_until_released() {
    let persistence = open_ephemeral();
    let observed = add_root(&persistence);
    let writer = add_root(&persistence);
    seed(&writer, vec![task("x", "x", 1)]);
    observed.drain();

    let query = LiveQuery::new(&observed, Query::all("Task"));
    let controller = LiveQueryController::new(&observed);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    observed.drain();
    seen.lock().clear();

    controller.mark_in_progress(&id("x"), &query, true);
    controller.mark_in_progress(&id("x"), &query, true);
    assert!(controller.is_in_progress(&id("x"), &query));

    let mut edited = writer.find(&id("x")).unwrap().unwrap();
    edited.set("title", "edited");
    writer.update(edited).unwrap();
    writer.save().unwrap();
    observed.drain();
    assert!(seen.lock().is_empty());

    controller.mark_in_progress(&id("x"), &query, false);
    assert!(!controller.is_in_progress(&id("x"), &query));

    let mut edited = writer.find(&id("x")).unwrap().unwrap();
    edited.set("title", "edited again");
    writer.update(edited).unwrap();
    writer.save().unwrap();
    observed.drain();
    assert_eq!(
        seen.lock().as_slice(),
        &[(ChangeKind::Update, "x".to_string())]
    );
}

#[test]
fn marking_unmanaged_query_is_a_no_op() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    let controller = LiveQueryController::new(&context);
    let query = LiveQuery::new(&context, Query::all("Task"));

    controller.mark_in_progress(&id("x"), &query, true);
    assert!(!controller.is_in_progress(&id("x"), &query));
}

#[test]
fn stop_then_start_replays_initial_inserts() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    seed(&context, vec![task("t1", "one", 1), task("t2", "two", 2)]);

    let query = LiveQuery::new(&context, Query::all("Task"));
    let controller = LiveQueryController::new(&context);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();

    controller.start();
    context.drain();
    let first_run = seen.lock().clone();
    seen.lock().clear();

    controller.stop();
    context.drain();
    assert!(!controller.is_started());

    controller.start();
    context.drain();
    assert_eq!(*seen.lock(), first_run);
    assert_eq!(first_run.len(), 2);
}

#[test]
fn stopped_controller_ignores_changes() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    let query = LiveQuery::new(&context, Query::all("Task"));
    let controller = LiveQueryController::new(&context);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    controller.stop();
    context.drain();

    seed(&context, vec![task("t1", "one", 1)]);
    context.drain();
    assert!(seen.lock().is_empty());
}

#[test]
fn register_keeps_first_handler_and_checks_context() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    let other = add_root(&persistence);
    let controller = LiveQueryController::new(&context);
    let query = LiveQuery::new(&context, Query::all("Task"));

    let first: Seen = Arc::default();
    let second: Seen = Arc::default();
    assert_eq!(
        controller.register(&query, recorder(&first)).unwrap(),
        Registration::Added
    );
    assert_eq!(
        controller.register(&query, recorder(&second)).unwrap(),
        Registration::AlreadyRegistered
    );
    assert_eq!(controller.managed_count(), 1);

    let foreign = LiveQuery::new(&other, Query::all("Task"));
    assert!(matches!(
        controller.register(&foreign, recorder(&first)),
        Err(ObserveError::ContextMismatch { .. })
    ));

    controller.start();
    seed(&context, vec![task("t1", "one", 1)]);
    context.drain();
    assert_eq!(first.lock().len(), 1);
    assert!(second.lock().is_empty());
}

#[test]
fn unregister_and_clear_drop_queries() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    let controller = LiveQueryController::new(&context);
    let kept = LiveQuery::new(&context, Query::all("Task"));
    let dropped = LiveQuery::new(&context, Query::all("Tag"));
    let seen: Seen = Arc::default();
    controller.register(&kept, recorder(&seen)).unwrap();
    controller.register(&dropped, recorder(&seen)).unwrap();
    controller.mark_in_progress(&id("x"), &dropped, true);

    assert!(controller.unregister(&dropped));
    assert!(!controller.unregister(&dropped));
    assert!(!controller.is_in_progress(&id("x"), &dropped));
    assert!(controller.is_managed(&kept));

    controller.clear();
    context.drain();
    assert_eq!(controller.managed_count(), 0);
}

#[test]
fn sections_group_by_field() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    seed(
        &context,
        vec![
            task("t1", "one", 1).with("list", "home"),
            task("t2", "two", 2).with("list", "work"),
            task("t3", "three", 3).with("list", "home"),
        ],
    );

    let query = LiveQuery::new(
        &context,
        Query::all("Task").sort_by("rank", true).group_by("list"),
    );
    query.fetch().unwrap();
    let sections = query.sections();

    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].key, Some(json!("home")));
    let home: Vec<_> = sections[0]
        .records
        .iter()
        .map(|record| record.id().to_string())
        .collect();
    assert_eq!(home, vec!["t1", "t3"]);
    assert_eq!(sections[1].key, Some(json!("work")));
}

#[test]
fn changes_for_record_follows_one_identity() {
    let persistence = open_ephemeral();
    let context = add_root(&persistence);
    seed(&context, vec![task("t1", "one", 1), task("t2", "two", 2)]);

    let record = context.find(&id("t1")).unwrap().unwrap();
    let query = collection::changes_for_record(&context, &record);
    let controller = LiveQueryController::new(&context);
    let seen: Seen = Arc::default();
    controller.register(&query, recorder(&seen)).unwrap();
    controller.start();
    context.drain();

    assert_eq!(
        seen.lock().as_slice(),
        &[(ChangeKind::Insert, "t1".to_string())]
    );
}
