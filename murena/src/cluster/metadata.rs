//! Fetching topology metadata from the system tables of a node.
//!
//! This is deliberately minimal: one round of `system.local` +
//! `system.peers` queries learns peer addresses, host ids and token
//! ownership. Event-driven topology discovery is out of scope; the
//! registry is refreshed on session creation and on explicit request.

use std::net::{IpAddr, SocketAddr};

use murena_cql::frame::response::result;
use murena_cql::value::{CqlValue, Row};
use tracing::warn;
use uuid::Uuid;

use crate::errors::MetadataError;
use crate::network::connection::Connection;
use crate::routing::Token;

const LOCAL_QUERY: &str =
    "SELECT host_id, data_center, rack, tokens FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT host_id, rpc_address, data_center, rack, tokens FROM system.peers";

/// Everything the registry tracks about a peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub(crate) address: SocketAddr,
    pub(crate) host_id: Uuid,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) tokens: Vec<Token>,
}

impl PeerInfo {
    /// A contact point before any metadata is known. The placeholder
    /// host id is replaced once `system.local` is read.
    pub(crate) fn contact_point(address: SocketAddr) -> Self {
        PeerInfo {
            address,
            host_id: Uuid::new_v4(),
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
        }
    }
}

/// Queries `system.local` and `system.peers` over the given connection.
///
/// The connection's own node is always first in the returned list.
pub(crate) async fn fetch_peers(conn: &Connection) -> Result<Vec<PeerInfo>, MetadataError> {
    let local_rows = fetch_rows(conn, LOCAL_QUERY).await?;
    let peer_rows = fetch_rows(conn, PEERS_QUERY).await?;

    let connect_address = conn.get_connect_address();
    let mut peers = Vec::with_capacity(1 + peer_rows.len());

    for row in &local_rows {
        // system.local reports the node we are connected to; its
        // broadcast address may be unusable (0.0.0.0), so the connect
        // address is authoritative.
        match parse_peer_row(row, Some(connect_address), connect_address.port()) {
            Ok(peer) => peers.push(peer),
            Err(reason) => return Err(MetadataError::MalformedRow(reason)),
        }
    }
    if peers.is_empty() {
        return Err(MetadataError::MalformedRow("system.local returned no rows"));
    }

    for row in &peer_rows {
        match parse_peer_row(row, None, connect_address.port()) {
            Ok(peer) => peers.push(peer),
            Err(reason) => {
                // A single broken peer row must not take the whole
                // refresh down.
                warn!(reason, "Skipping malformed system.peers row");
            }
        }
    }

    Ok(peers)
}

async fn fetch_rows(conn: &Connection, query: &str) -> Result<Vec<Row>, MetadataError> {
    let response = conn.query_single_page_raw(query).await?;
    match response.result {
        result::Result::Rows(rows) => Ok(rows.rows),
        _ => Err(MetadataError::MalformedRow(
            "Expected Rows result for a metadata query",
        )),
    }
}

fn parse_peer_row(
    row: &Row,
    known_address: Option<SocketAddr>,
    port: u16,
) -> Result<PeerInfo, &'static str> {
    // Column order matches the SELECT lists above; `system.local` has
    // no rpc_address column in ours, the connect address is used instead.
    let mut columns = row.columns.iter();

    let host_id = columns
        .next()
        .and_then(|c| c.as_ref())
        .and_then(CqlValue::as_uuid)
        .ok_or("host_id missing or not a uuid")?;

    let address = match known_address {
        Some(address) => address,
        None => {
            let ip = columns
                .next()
                .and_then(|c| c.as_ref())
                .and_then(CqlValue::as_inet)
                .ok_or("rpc_address missing or not an inet")?;
            if ip == IpAddr::from([0u8, 0, 0, 0]) {
                return Err("peer advertises rpc_address 0.0.0.0");
            }
            SocketAddr::new(ip, port)
        }
    };

    let datacenter = columns
        .next()
        .and_then(|c| c.as_ref())
        .and_then(CqlValue::as_text)
        .map(str::to_owned);
    let rack = columns
        .next()
        .and_then(|c| c.as_ref())
        .and_then(CqlValue::as_text)
        .map(str::to_owned);

    let tokens = match columns.next().and_then(|c| c.as_ref()) {
        Some(value) => parse_tokens(value)?,
        None => Vec::new(),
    };

    Ok(PeerInfo {
        address,
        host_id,
        datacenter,
        rack,
        tokens,
    })
}

fn parse_tokens(value: &CqlValue) -> Result<Vec<Token>, &'static str> {
    let raw_tokens = value.as_list().ok_or("tokens column is not a collection")?;
    let mut tokens = Vec::with_capacity(raw_tokens.len());
    for raw in raw_tokens {
        let text = raw.as_text().ok_or("token is not textual")?;
        let parsed: i64 = text.parse().map_err(|_| "token is not a valid i64")?;
        tokens.push(Token::new(parsed));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_row(host_id: Uuid, ip: [u8; 4], tokens: &[&str]) -> Row {
        Row {
            columns: vec![
                Some(CqlValue::Uuid(host_id)),
                Some(CqlValue::Inet(IpAddr::from(ip))),
                Some(CqlValue::Text("dc1".to_owned())),
                Some(CqlValue::Text("rack1".to_owned())),
                Some(CqlValue::Set(
                    tokens
                        .iter()
                        .map(|t| CqlValue::Text((*t).to_owned()))
                        .collect(),
                )),
            ],
        }
    }

    #[test]
    fn parses_a_peer_row() {
        let host_id = Uuid::new_v4();
        let row = peer_row(host_id, [10, 0, 0, 7], &["-42", "100"]);

        let peer = parse_peer_row(&row, None, 9042).unwrap();
        assert_eq!(peer.host_id, host_id);
        assert_eq!(peer.address, "10.0.0.7:9042".parse().unwrap());
        assert_eq!(peer.datacenter.as_deref(), Some("dc1"));
        assert_eq!(peer.tokens, vec![Token::new(-42), Token::new(100)]);
    }

    #[test]
    fn rejects_unbound_rpc_address() {
        let row = peer_row(Uuid::new_v4(), [0, 0, 0, 0], &[]);
        assert!(parse_peer_row(&row, None, 9042).is_err());
    }

    #[test]
    fn local_row_uses_connect_address() {
        let host_id = Uuid::new_v4();
        // Local row has no rpc_address column.
        let row = Row {
            columns: vec![
                Some(CqlValue::Uuid(host_id)),
                Some(CqlValue::Text("dc1".to_owned())),
                None,
                Some(CqlValue::Set(vec![CqlValue::Text("17".to_owned())])),
            ],
        };
        let connect_address: SocketAddr = "192.168.1.2:19042".parse().unwrap();

        let peer = parse_peer_row(&row, Some(connect_address), 19042).unwrap();
        assert_eq!(peer.address, connect_address);
        assert_eq!(peer.host_id, host_id);
        assert_eq!(peer.rack, None);
        assert_eq!(peer.tokens, vec![Token::new(17)]);
    }
}
