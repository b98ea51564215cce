//! End-to-end tests against a scripted in-memory client: fetching with the
//! three prefetch semantics, fault firing, identity uniqueness, and cache
//! hygiene around aborted reads.

use rowgraph::prelude::*;
use rowgraph::{ColumnInfo, DbTransaction, Row, RowCursor, read_object};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves canned rows for SELECTs matched by substring and accepts all
/// writes.
#[derive(Default)]
struct ScriptedClient {
    responses: Mutex<Vec<(String, Vec<Row>)>>,
    selected: Mutex<Vec<String>>,
    executed: Mutex<Vec<(String, Vec<Value>)>>,
}

impl ScriptedClient {
    fn respond(&self, fragment: &str, rows: Vec<Row>) {
        self.responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), rows));
    }

    fn selects(&self) -> Vec<String> {
        self.selected.lock().unwrap().clone()
    }
}

struct VecCursor {
    rows: std::vec::IntoIter<Row>,
}

impl RowCursor for VecCursor {
    fn next_row(&mut self) -> rowgraph::Result<Option<Row>> {
        Ok(self.rows.next())
    }
}

struct NoopTx<'a> {
    client: &'a ScriptedClient,
}

impl DbTransaction for NoopTx<'_> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> rowgraph::Result<u64> {
        self.client
            .executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(1)
    }

    fn commit(self: Box<Self>) -> rowgraph::Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> rowgraph::Result<()> {
        Ok(())
    }
}

impl DbClient for ScriptedClient {
    fn select<'a>(
        &'a self,
        sql: &str,
        _params: &[Value],
    ) -> rowgraph::Result<Box<dyn RowCursor + 'a>> {
        self.selected.lock().unwrap().push(sql.to_string());
        // The most specific (longest) matching fragment wins, so a narrow
        // fault query is never served by a broad table-scan registration.
        let rows = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .filter(|(fragment, _)| sql.contains(fragment))
            .max_by_key(|(fragment, _)| fragment.len())
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Ok(Box::new(VecCursor {
            rows: rows.into_iter(),
        }))
    }

    fn execute(&self, sql: &str, params: &[Value]) -> rowgraph::Result<u64> {
        self.executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(1)
    }

    fn begin<'a>(&'a self) -> rowgraph::Result<Box<dyn DbTransaction + 'a>> {
        Ok(Box::new(NoopTx { client: self }))
    }
}

fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register(
        Entity::new("Artist", "artist")
            .attribute(Attribute::new("id").primary_key().generated())
            .attribute(Attribute::new("name"))
            .attribute(Attribute::new("biography").lazy())
            .relationship(
                Relationship::to_many("paintings", "Painting", "artist_id", "id")
                    .delete_rule(DeleteRule::Cascade)
                    .reverse("artist"),
            ),
    );
    registry.register(
        Entity::new("Painting", "painting")
            .attribute(Attribute::new("id").primary_key().generated())
            .attribute(Attribute::new("title"))
            .attribute(Attribute::new("artist_id"))
            .relationship(
                Relationship::to_one("artist", "Artist", "artist_id", "id").reverse("paintings"),
            ),
    );
    registry
}

fn setup() -> (Arc<Domain>, Arc<ScriptedClient>) {
    let client = Arc::new(ScriptedClient::default());
    let domain = Arc::new(
        Domain::builder(registry(), Arc::clone(&client) as Arc<dyn DbClient>).build(),
    );
    (domain, client)
}

fn row(pairs: &[(&str, Value)]) -> Row {
    let columns = Arc::new(ColumnInfo::new(
        pairs.iter().map(|(name, _)| (*name).to_string()).collect(),
    ));
    Row::with_columns(columns, pairs.iter().map(|(_, v)| v.clone()).collect())
}

fn artist_rows() -> Vec<Row> {
    vec![
        row(&[
            ("t0__id", Value::BigInt(1)),
            ("t0__name", Value::Text("Dali".into())),
        ]),
        row(&[
            ("t0__id", Value::BigInt(2)),
            ("t0__name", Value::Text("Monet".into())),
        ]),
    ]
}

fn painting_rows() -> Vec<Row> {
    vec![
        row(&[
            ("t0__id", Value::BigInt(10)),
            ("t0__title", Value::Text("Clocks".into())),
            ("t0__artist_id", Value::BigInt(1)),
        ]),
        row(&[
            ("t0__id", Value::BigInt(11)),
            ("t0__title", Value::Text("Elephants".into())),
            ("t0__artist_id", Value::BigInt(1)),
        ]),
        row(&[
            ("t0__id", Value::BigInt(12)),
            ("t0__title", Value::Text("Water Lilies".into())),
            ("t0__artist_id", Value::BigInt(2)),
        ]),
    ]
}

fn related(session: &mut Session, handle: &ObjectHandle) -> Vec<ObjectId> {
    session.related_ids(handle, "paintings").unwrap()
}

#[test]
fn fetch_registers_committed_objects_once() {
    let (domain, client) = setup();
    client.respond("FROM \"artist\"", artist_rows());

    let mut session = Session::new(&domain);
    let first = session.perform(&ObjectQuery::new("Artist")).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(read_object(&first[0]).state(), ObjectState::Committed);
    assert_eq!(
        read_object(&first[0]).get("name"),
        Some(&Value::Text("Dali".into()))
    );

    // Refetching yields the same instances, not copies.
    let second = session.perform(&ObjectQuery::new("Artist")).unwrap();
    assert!(Arc::ptr_eq(&first[0], &second[0]));
    assert!(Arc::ptr_eq(&first[1], &second[1]));

    // Snapshots landed in the shared cache.
    let id = read_object(&first[0]).id().clone();
    assert!(domain.cache().get(&id).is_some());
}

#[test]
fn prefetch_semantics_agree_on_resolved_graphs() {
    let mut by_semantics = Vec::new();
    for semantics in [
        PrefetchSemantics::Joint,
        PrefetchSemantics::Disjoint,
        PrefetchSemantics::DisjointById,
    ] {
        let (domain, client) = setup();
        // Joint reads one wide result; the others read artist + painting.
        client.respond(
            "LEFT JOIN \"painting\"",
            vec![
                row(&[
                    ("t0__id", Value::BigInt(1)),
                    ("t0__name", Value::Text("Dali".into())),
                    ("t1__id", Value::BigInt(10)),
                    ("t1__title", Value::Text("Clocks".into())),
                    ("t1__artist_id", Value::BigInt(1)),
                ]),
                row(&[
                    ("t0__id", Value::BigInt(1)),
                    ("t0__name", Value::Text("Dali".into())),
                    ("t1__id", Value::BigInt(11)),
                    ("t1__title", Value::Text("Elephants".into())),
                    ("t1__artist_id", Value::BigInt(1)),
                ]),
                row(&[
                    ("t0__id", Value::BigInt(2)),
                    ("t0__name", Value::Text("Monet".into())),
                    ("t1__id", Value::BigInt(12)),
                    ("t1__title", Value::Text("Water Lilies".into())),
                    ("t1__artist_id", Value::BigInt(2)),
                ]),
            ],
        );
        client.respond("FROM \"artist\"", artist_rows());
        client.respond("FROM \"painting\"", painting_rows());

        let mut session = Session::new(&domain);
        let roots = session
            .perform(&ObjectQuery::new("Artist").prefetch("paintings", semantics))
            .unwrap();
        assert_eq!(roots.len(), 2, "{semantics:?}");

        let graph: Vec<(ObjectId, Vec<ObjectId>)> = roots
            .iter()
            .map(|r| {
                let id = read_object(r).id().clone();
                let mut children = related(&mut session, r);
                children.sort_by_key(std::string::ToString::to_string);
                (id, children)
            })
            .collect();
        by_semantics.push((semantics, graph));
    }

    let (_, ref baseline) = by_semantics[0];
    for (semantics, graph) in &by_semantics[1..] {
        assert_eq!(graph, baseline, "{semantics:?}");
    }
}

#[test]
fn limit_demotes_disjoint_to_by_id_fetch() {
    let (domain, client) = setup();
    client.respond("FROM \"artist\"", artist_rows());
    client.respond("FROM \"painting\"", painting_rows());

    let mut session = Session::new(&domain);
    let roots = session
        .perform(
            &ObjectQuery::new("Artist")
                .prefetch("paintings", PrefetchSemantics::Disjoint)
                .limit(2),
        )
        .unwrap();
    assert_eq!(roots.len(), 2);

    // The secondary ran as an IN-list over the fetched owner keys.
    let selects = client.selects();
    let secondary = selects
        .iter()
        .find(|sql| sql.contains("FROM \"painting\""))
        .expect("secondary select");
    assert!(secondary.contains("IN ("));

    assert_eq!(related(&mut session, &roots[0]).len(), 2);
    assert_eq!(related(&mut session, &roots[1]).len(), 1);
}

#[test]
fn owner_without_children_gets_resolved_empty_collection() {
    let (domain, client) = setup();
    client.respond(
        "FROM \"artist\"",
        vec![row(&[
            ("t0__id", Value::BigInt(3)),
            ("t0__name", Value::Text("Vermeer".into())),
        ])],
    );
    client.respond("FROM \"painting\"", Vec::new());

    let mut session = Session::new(&domain);
    let roots = session
        .perform(&ObjectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::Disjoint))
        .unwrap();

    let selects_before = client.selects().len();
    match read_object(&roots[0]).relationship("paintings") {
        Some(RelationshipHolder::ToMany(ids)) => assert!(ids.is_empty()),
        other => panic!("expected resolved empty collection, got {other:?}"),
    }
    // Reading it again must not go back to the database.
    assert!(related(&mut session, &roots[0]).is_empty());
    assert_eq!(client.selects().len(), selects_before);
}

#[test]
fn lazy_attribute_fires_targeted_fault_query() {
    let (domain, client) = setup();
    client.respond("FROM \"artist\"", artist_rows());
    client.respond(
        "SELECT \"biography\"",
        vec![row(&[(
            "biography",
            Value::Text("Born in Figueres".into()),
        )])],
    );

    let mut session = Session::new(&domain);
    let roots = session.perform(&ObjectQuery::new("Artist")).unwrap();
    // The wide fetch did not carry the lazy column.
    assert!(read_object(&roots[0]).get("biography").is_none());

    let value = session.get_property(&roots[0], "biography").unwrap();
    assert_eq!(value, Value::Text("Born in Figueres".into()));
    // Now materialized on the object; no second query on re-read.
    let selects_before = client.selects().len();
    let again = session.get_property(&roots[0], "biography").unwrap();
    assert_eq!(again, value);
    assert_eq!(client.selects().len(), selects_before);
}

#[test]
fn fault_query_without_requested_column_is_an_error() {
    let (domain, client) = setup();
    client.respond("FROM \"artist\"", artist_rows());
    // The fault response carries a row, but not the column that was asked
    // for; that must surface as an error, never as a silent NULL.
    client.respond(
        "SELECT \"biography\"",
        vec![row(&[("id", Value::BigInt(1))])],
    );

    let mut session = Session::new(&domain);
    let roots = session.perform(&ObjectQuery::new("Artist")).unwrap();
    let err = session.get_property(&roots[0], "biography").unwrap_err();
    assert!(matches!(err, Error::Query(_)));
    assert!(read_object(&roots[0]).get("biography").is_none());
}

#[test]
fn missing_backing_row_leaves_object_hollow() {
    let (domain, _client) = setup();
    let mut session = Session::new(&domain);

    let id = ObjectId::single("Artist", "id", Value::BigInt(404));
    let handle = session.local_object(None, &id);
    assert_eq!(read_object(&handle).state(), ObjectState::Hollow);

    let err = session.get_property(&handle, "name").unwrap_err();
    assert!(matches!(err, Error::Fault(_)));
    assert_eq!(read_object(&handle).state(), ObjectState::Hollow);
}

#[test]
fn timed_out_read_leaves_caches_untouched() {
    let (domain, client) = setup();
    client.respond("FROM \"artist\"", artist_rows());

    let mut session = Session::new(&domain);
    let err = session
        .perform(&ObjectQuery::new("Artist").timeout(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(domain.cache().is_empty());
    assert!(session.store().is_empty());
}

#[test]
fn boundary_sized_values_survive_the_client_round_trip() {
    let payloads = vec![
        Value::Text(String::new()),
        Value::Text("x".to_string()),
        Value::Text("a".repeat(4096)),
        Value::Text("b".repeat(4 * 1024 * 1024)),
        Value::Bytes(Vec::new()),
        Value::Bytes(vec![0xAB]),
        Value::Bytes(vec![0xCD; 4096]),
        Value::Bytes(vec![0xEF; 4 * 1024 * 1024]),
    ];
    for payload in payloads {
        let (domain, client) = setup();
        let mut session = Session::new(&domain);
        let artist = session.create_object("Artist").unwrap();
        session
            .set_property(&artist, "name", payload.clone())
            .unwrap();
        session.commit_changes().unwrap();

        // What actually crossed the client boundary on the write side.
        let written = {
            let executed = client.executed.lock().unwrap();
            let (_, params) = executed
                .iter()
                .find(|(sql, _)| sql.starts_with("INSERT"))
                .expect("insert statement");
            params
                .iter()
                .find(|p| matches!(p, Value::Text(_) | Value::Bytes(_)))
                .expect("payload parameter")
                .clone()
        };
        assert_eq!(written, payload);

        // Refetch from a response built out of the written parameter, not
        // out of the original value.
        let id = read_object(&artist).id().clone();
        let key = id.key_pairs()[0].1.clone();
        client.respond(
            "FROM \"artist\"",
            vec![row(&[("t0__id", key), ("t0__name", written)])],
        );
        session.invalidate(&[id]);
        assert_eq!(read_object(&artist).state(), ObjectState::Hollow);
        let fetched = session.get_property(&artist, "name").unwrap();
        assert_eq!(fetched, payload);
    }
}

#[test]
fn commit_then_peer_session_sees_snapshot_after_drain() {
    let (domain, _client) = setup();
    let mut writer = Session::new(&domain);
    let artist = writer.create_object("Artist").unwrap();
    writer
        .set_property(&artist, "name", Value::Text("Dali".into()))
        .unwrap();
    writer.commit_changes().unwrap();
    assert!(domain.drain_events(Duration::from_secs(5)));

    let id = read_object(&artist).id().clone();
    assert!(!id.is_temporary());

    let mut peer = Session::new(&domain);
    let local = peer.local_object(None, &id);
    assert_eq!(read_object(&local).state(), ObjectState::Committed);
    assert_eq!(
        read_object(&local).get("name"),
        Some(&Value::Text("Dali".into()))
    );
}
