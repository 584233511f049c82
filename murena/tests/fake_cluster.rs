//! End-to-end tests of the session engine against an in-process node
//! speaking CQL protocol v4.
//!
//! The fake node answers the connection negotiation, the metadata and
//! schema-version queries the driver issues on its own, and a handful of
//! canned user tables. It can also misbehave on demand: report itself
//! overloaded, evict a prepared statement, or swallow a request without
//! answering.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use murena::client::session_builder::SessionBuilder;
use murena::errors::ExecutionError;
use murena::{Batch, BatchType, CqlValue, QueryValues, Session};

use murena_cql::frame::request::batch::Batch as BatchFrame;
use murena_cql::frame::request::prepare::PrepareOwned;
use murena_cql::frame::request::query::{Query, QueryParameters};
use murena_cql::frame::request::{DeserializableRequest, Execute};
use murena_cql::frame::types;

const NUMBERS_TOTAL: i32 = 8;

#[derive(Default)]
struct NodeState {
    host_id: Uuid,
    schema_version: Uuid,
    /// Peers this node advertises in system.peers.
    peers: Vec<(Uuid, IpAddr)>,
    /// Query texts answered with an Overloaded error.
    overloaded_texts: HashSet<String>,
    /// When set, the next EXECUTE is answered with UNPREPARED once.
    evict_next_execute: AtomicBool,

    query_log: Mutex<Vec<String>>,
    prepare_log: Mutex<Vec<String>>,
    batch_log: Mutex<Vec<usize>>,
}

impl NodeState {
    fn new(host_id: Uuid, schema_version: Uuid) -> Self {
        NodeState {
            host_id,
            schema_version,
            ..Default::default()
        }
    }

    fn queries_of(&self, fragment: &str) -> usize {
        self.query_log
            .lock()
            .unwrap()
            .iter()
            .filter(|text| text.contains(fragment))
            .count()
    }

    fn prepares_of(&self, fragment: &str) -> usize {
        self.prepare_log
            .lock()
            .unwrap()
            .iter()
            .filter(|text| text.contains(fragment))
            .count()
    }
}

async fn spawn_fake_node(bind: SocketAddr, state: Arc<NodeState>) -> SocketAddr {
    let listener = TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = Arc::clone(&state);
            tokio::spawn(serve_connection(stream, state));
        }
    });
    addr
}

async fn serve_connection(mut stream: TcpStream, state: Arc<NodeState>) {
    loop {
        let mut header = [0u8; 9];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        assert_eq!(header[0], 0x04, "fake node only speaks protocol v4");
        let stream_id = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let body_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let response = handle_request(opcode, &body, &state);
        if let Some((response_opcode, response_body)) = response {
            let mut frame = Vec::with_capacity(9 + response_body.len());
            frame.push(0x84);
            frame.push(0x00);
            frame.extend_from_slice(&stream_id.to_be_bytes());
            frame.push(response_opcode);
            frame.extend_from_slice(&(response_body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&response_body);
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

// Returns (response opcode, response body), or None to swallow the
// request.
fn handle_request(opcode: u8, body: &[u8], state: &NodeState) -> Option<(u8, Vec<u8>)> {
    match opcode {
        // OPTIONS
        0x05 => {
            let mut response = Vec::new();
            let mut options = std::collections::HashMap::new();
            options.insert(
                "COMPRESSION".to_string(),
                vec!["lz4".to_string(), "snappy".to_string()],
            );
            options.insert("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]);
            types::write_string_multimap(&options, &mut response).unwrap();
            Some((0x06, response))
        }
        // STARTUP -> READY
        0x01 => Some((0x02, Vec::new())),
        // QUERY
        0x07 => {
            let query = Query::deserialize(&mut &body[..]).unwrap();
            handle_query(&query.contents, &query.parameters, state)
        }
        // PREPARE
        0x09 => {
            let prepare = PrepareOwned::deserialize(&mut &body[..]).unwrap();
            state
                .prepare_log
                .lock()
                .unwrap()
                .push(prepare.query.clone());
            Some((0x08, prepared_body(&prepare.query)))
        }
        // EXECUTE: the fake's statement ids are the statement texts
        // themselves, so execution is dispatched like a query.
        0x0A => {
            let execute = Execute::deserialize(&mut &body[..]).unwrap();
            if state.evict_next_execute.swap(false, Ordering::SeqCst) {
                return Some((0x00, unprepared_error_body(&execute.id)));
            }
            let text = String::from_utf8(execute.id.to_vec()).unwrap();
            handle_query(&text, &execute.parameters, state)
        }
        // BATCH -> Void
        0x0D => {
            let batch = BatchFrame::deserialize(&mut &body[..]).unwrap();
            state
                .batch_log
                .lock()
                .unwrap()
                .push(batch.statements.len());
            Some((0x08, void_body()))
        }
        other => panic!("fake node got an unexpected opcode: {:#x}", other),
    }
}

fn handle_query(
    contents: &str,
    parameters: &QueryParameters<'_>,
    state: &NodeState,
) -> Option<(u8, Vec<u8>)> {
    state.query_log.lock().unwrap().push(contents.to_string());

    if state.overloaded_texts.contains(contents) {
        return Some((0x00, overloaded_error_body()));
    }

    if contents.contains("schema_version") {
        let body = rows_body(
            &[("schema_version", ColType::Uuid)],
            vec![vec![Some(state.schema_version.as_bytes().to_vec())]],
            None,
        );
        return Some((0x08, body));
    }

    if contents.contains("FROM system.local") {
        let body = rows_body(
            &[
                ("host_id", ColType::Uuid),
                ("data_center", ColType::Text),
                ("rack", ColType::Text),
                ("tokens", ColType::SetOfText),
            ],
            vec![vec![
                Some(state.host_id.as_bytes().to_vec()),
                Some(b"dc1".to_vec()),
                Some(b"r1".to_vec()),
                Some(0_i32.to_be_bytes().to_vec()), // empty set
            ]],
            None,
        );
        return Some((0x08, body));
    }

    if contents.contains("FROM system.peers") {
        let rows = state
            .peers
            .iter()
            .map(|(host_id, ip)| {
                let ip_bytes = match ip {
                    IpAddr::V4(v4) => v4.octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                vec![
                    Some(host_id.as_bytes().to_vec()),
                    Some(ip_bytes),
                    Some(b"dc1".to_vec()),
                    Some(b"r1".to_vec()),
                    Some(0_i32.to_be_bytes().to_vec()),
                ]
            })
            .collect();
        let body = rows_body(
            &[
                ("host_id", ColType::Uuid),
                ("rpc_address", ColType::Inet),
                ("data_center", ColType::Text),
                ("rack", ColType::Text),
                ("tokens", ColType::SetOfText),
            ],
            rows,
            None,
        );
        return Some((0x08, body));
    }

    if let Some(keyspace) = contents.strip_prefix("USE ") {
        let keyspace = keyspace.trim_matches('"');
        let mut body = Vec::new();
        types::write_int(0x0003, &mut body);
        types::write_string(keyspace, &mut body).unwrap();
        return Some((0x08, body));
    }

    if contents.contains("FROM ks.t ") || contents.ends_with("FROM ks.t") {
        let body = rows_body(
            &[("a", ColType::Int), ("b", ColType::Text)],
            vec![
                vec![Some(1_i32.to_be_bytes().to_vec()), Some(b"x".to_vec())],
                vec![Some(2_i32.to_be_bytes().to_vec()), None],
                vec![Some(3_i32.to_be_bytes().to_vec()), Some(b"z".to_vec())],
            ],
            None,
        );
        return Some((0x08, body));
    }

    if contents.contains("FROM ks.numbers") {
        let start = parameters
            .paging_state
            .as_ref()
            .map(|token| i32::from_be_bytes(token[..4].try_into().unwrap()))
            .unwrap_or(0);
        let page_size = parameters.page_size.unwrap_or(NUMBERS_TOTAL);
        let end = (start + page_size).min(NUMBERS_TOTAL);

        let rows = (start..end)
            .map(|n| vec![Some(n.to_be_bytes().to_vec())])
            .collect();
        let paging_state = (end < NUMBERS_TOTAL).then(|| end.to_be_bytes().to_vec());
        let body = rows_body(&[("n", ColType::Int)], rows, paging_state.as_deref());
        return Some((0x08, body));
    }

    if contents.contains("FROM ks.prep") {
        let body = rows_body(
            &[("x", ColType::Int)],
            vec![vec![Some(7_i32.to_be_bytes().to_vec())]],
            None,
        );
        return Some((0x08, body));
    }

    if contents.contains("FROM ks.overloaded") {
        let body = rows_body(
            &[("v", ColType::Int)],
            vec![vec![Some(42_i32.to_be_bytes().to_vec())]],
            None,
        );
        return Some((0x08, body));
    }

    if contents.contains("FROM ks.slow") {
        // Swallow the request; the driver's timeout has to handle it.
        return None;
    }

    // INSERTs, DDL and everything else are answered with Void.
    Some((0x08, void_body()))
}

#[derive(Clone, Copy)]
enum ColType {
    Int,
    Text,
    Uuid,
    Inet,
    SetOfText,
}

impl ColType {
    fn write(self, buf: &mut Vec<u8>) {
        match self {
            ColType::Int => types::write_short(0x0009, buf),
            ColType::Text => types::write_short(0x000D, buf),
            ColType::Uuid => types::write_short(0x000C, buf),
            ColType::Inet => types::write_short(0x0010, buf),
            ColType::SetOfText => {
                types::write_short(0x0022, buf);
                types::write_short(0x000D, buf);
            }
        }
    }
}

fn rows_body(
    cols: &[(&str, ColType)],
    rows: Vec<Vec<Option<Vec<u8>>>>,
    paging_state: Option<&[u8]>,
) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0002, &mut body);

    let mut flags = 0x0001; // global table spec
    if paging_state.is_some() {
        flags |= 0x0002;
    }
    types::write_int(flags, &mut body);
    types::write_int(cols.len() as i32, &mut body);
    if let Some(paging_state) = paging_state {
        types::write_bytes(paging_state, &mut body).unwrap();
    }
    types::write_string("ks", &mut body).unwrap();
    types::write_string("t", &mut body).unwrap();
    for (name, typ) in cols {
        types::write_string(name, &mut body).unwrap();
        typ.write(&mut body);
    }

    types::write_int(rows.len() as i32, &mut body);
    for row in rows {
        assert_eq!(row.len(), cols.len());
        for cell in row {
            types::write_bytes_opt(cell, &mut body).unwrap();
        }
    }
    body
}

fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

fn prepared_body(text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(text.as_bytes(), &mut body).unwrap();

    // Bind-marker metadata: one int marker which is the partition key.
    types::write_int(0x0001, &mut body);
    types::write_int(1, &mut body);
    types::write_int(1, &mut body);
    types::write_short(0, &mut body);
    types::write_string("ks", &mut body).unwrap();
    types::write_string("prep", &mut body).unwrap();
    types::write_string("k", &mut body).unwrap();
    ColType::Int.write(&mut body);

    // Result metadata: one int column.
    types::write_int(0x0001, &mut body);
    types::write_int(1, &mut body);
    types::write_string("ks", &mut body).unwrap();
    types::write_string("prep", &mut body).unwrap();
    types::write_string("x", &mut body).unwrap();
    ColType::Int.write(&mut body);

    body
}

fn unprepared_error_body(id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x2500, &mut body);
    types::write_string("statement evicted", &mut body).unwrap();
    types::write_short_bytes(id, &mut body).unwrap();
    body
}

fn overloaded_error_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x1001, &mut body);
    types::write_string("node overloaded", &mut body).unwrap();
    body
}

async fn single_node_session(state: Arc<NodeState>) -> Session {
    let addr = spawn_fake_node("127.0.0.1:0".parse().unwrap(), state).await;
    SessionBuilder::new()
        .known_node_addr(addr)
        .schema_agreement_timeout(Duration::from_secs(5))
        .schema_agreement_interval(Duration::from_millis(50))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn connects_and_reads_rows() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    let result = session.query("SELECT a, b FROM ks.t", ()).await.unwrap();

    assert_eq!(result.rows_num(), 3);
    let first = result.first_row().unwrap();
    assert_eq!(first.get(0).unwrap(), &Some(CqlValue::Int(1)));
    assert_eq!(
        first.get_by_name("b"),
        Some(&Some(CqlValue::Text("x".to_string())))
    );
    // A NULL cell arrives as an explicit absence, not a default value.
    assert_eq!(result.rows()[1].get_by_name("b"), Some(&None));

    // Three rows cannot be a single row.
    assert!(result.single_row().is_err());
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn executes_prepared_and_survives_node_side_eviction() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    let text = "SELECT x FROM ks.prep WHERE k = ?";
    let prepared = session.prepare(text).await.unwrap();
    assert_eq!(state.prepares_of("ks.prep"), 1);

    // A second prepare of the same text is served from the cache.
    let _again = session.prepare(text).await.unwrap();
    assert_eq!(state.prepares_of("ks.prep"), 1);

    // The node evicts the statement; the driver must transparently
    // re-prepare and retry the execution once.
    state.evict_next_execute.store(true, Ordering::SeqCst);
    let result = session
        .execute(&prepared, vec![CqlValue::Int(5)])
        .await
        .unwrap();

    assert_eq!(
        result.single_row().unwrap().get(0).unwrap(),
        &Some(CqlValue::Int(7))
    );
    assert_eq!(state.prepares_of("ks.prep"), 2);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn paging_yields_every_row_exactly_once() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    let statement = murena::Statement::new("SELECT n FROM ks.numbers").with_page_size(3);
    let mut pager = session.query_pager(statement, ());

    let mut seen = Vec::new();
    let mut page_sizes = Vec::new();
    while let Some(page) = pager.next_page().await.unwrap() {
        page_sizes.push(page.rows_num());
        for row in &page {
            match row.get(0).unwrap() {
                Some(CqlValue::Int(n)) => seen.push(*n),
                other => panic!("unexpected cell: {:?}", other),
            }
        }
    }

    assert_eq!(page_sizes, vec![3, 3, 2]);
    assert_eq!(seen, (0..NUMBERS_TOTAL).collect::<Vec<_>>());
    assert!(pager.is_finished());
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn schema_agreement_converges_on_single_node() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    session
        .query("CREATE TABLE ks.fresh (k int PRIMARY KEY)", ())
        .await
        .unwrap();
    assert!(session.await_schema_agreement().await.unwrap());
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn logged_batch_is_sent_as_one_frame() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    let mut batch = Batch::new(BatchType::Logged);
    batch.append_statement("INSERT INTO ks.first (a) VALUES (?)");
    batch.append_statement("INSERT INTO ks.second (b) VALUES (?)");

    session
        .batch(
            &batch,
            vec![
                QueryValues::from(vec![CqlValue::Int(1)]),
                QueryValues::from(vec![CqlValue::Int(2)]),
            ],
        )
        .await
        .unwrap();

    assert_eq!(*state.batch_log.lock().unwrap(), vec![2]);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn timed_out_request_is_not_retried() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    let statement = murena::Statement::new("SELECT v FROM ks.slow")
        .with_timeout(Duration::from_millis(300));
    let error = session.query(statement, ()).await.unwrap_err();

    assert!(matches!(error, ExecutionError::RequestTimeout(_)));
    // The request is non-idempotent: the engine must not have retried it.
    assert_eq!(state.queries_of("ks.slow"), 1);

    // The connection survives a timed-out request; its stream id was
    // merely orphaned.
    let result = session.query("SELECT a, b FROM ks.t", ()).await.unwrap();
    assert_eq!(result.rows_num(), 3);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn use_keyspace_is_applied_and_visible() {
    let state = Arc::new(NodeState::new(Uuid::new_v4(), Uuid::new_v4()));
    let session = single_node_session(Arc::clone(&state)).await;

    session.use_keyspace("ks", false).await.unwrap();
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));
    assert_eq!(state.queries_of("USE ks"), 1);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn overloaded_coordinator_is_retried_on_another_node() {
    let schema_version = Uuid::new_v4();
    let host1 = Uuid::new_v4();
    let host2 = Uuid::new_v4();

    // Node 1 is permanently overloaded for the test query and advertises
    // node 2 as a peer; both listen on the same port, on different
    // loopback addresses.
    let overloaded_query = "SELECT v FROM ks.overloaded";
    let mut state1 = NodeState::new(host1, schema_version);
    state1
        .overloaded_texts
        .insert(overloaded_query.to_string());
    state1.peers = vec![(host2, "127.0.0.2".parse().unwrap())];
    let state1 = Arc::new(state1);
    let state2 = Arc::new(NodeState::new(host2, schema_version));

    let addr1 = spawn_fake_node("127.0.0.1:0".parse().unwrap(), Arc::clone(&state1)).await;
    let addr2: SocketAddr = SocketAddr::new("127.0.0.2".parse().unwrap(), addr1.port());
    spawn_fake_node(addr2, Arc::clone(&state2)).await;

    let session = SessionBuilder::new()
        .known_node_addr(addr1)
        .build()
        .await
        .unwrap();

    // Wait until the peer discovered through metadata has its pool up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = session.get_cluster_state();
        if state.nodes().len() == 2 && state.nodes().iter().all(|node| node.is_connected()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer pool did not come up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Whichever node the round-robin picks first, the idempotent request
    // must end up served: attempts landing on the overloaded node are
    // retried on the healthy one.
    for _ in 0..2 {
        let statement = murena::Statement::new(overloaded_query).with_idempotent(true);
        let result = session.query(statement, ()).await.unwrap();
        assert_eq!(
            result.single_row().unwrap().get(0).unwrap(),
            &Some(CqlValue::Int(42))
        );
    }

    // The overloaded node was actually consulted and refused at least
    // once, and every such attempt ended up retried on the healthy one.
    assert!(state1.queries_of("ks.overloaded") >= 1);
    assert!(state2.queries_of("ks.overloaded") >= 1);
}
