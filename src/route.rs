//! The host routing table.
//!
//! Routes map the `Host` a client asked for to the agent that can reach the
//! origin, plus the origin's address as seen from that agent. The table is
//! loaded once at startup and never changes afterwards, so lookups are plain
//! map reads with no locking.

use std::collections::HashMap;
use std::path::Path;

use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};

/// Where requests for one public host go.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{agent_id}:{origin}")]
pub struct RouteRecord {
    /// Agent that owns the origin.
    pub agent_id: String,
    /// `host:port` the agent dials locally.
    pub origin: String,
}

/// Immutable mapping from public host to [`RouteRecord`].
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    records: HashMap<String, RouteRecord>,
}

impl RouteTable {
    /// Reads a route file: a JSON object mapping each public host to
    /// `"<agent-id>:<origin-host:port>"`. Any malformed entry is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .std_context(format!("read route file {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Parses route records from their JSON representation.
    pub fn from_json(raw: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(raw).std_context("route file is not a JSON object of strings")?;
        let mut records = HashMap::with_capacity(raw.len());
        for (host, record) in raw {
            let (agent_id, origin) = record
                .split_once(':')
                .context(format!("route for {host} has no agent-id separator"))?;
            ensure_any!(!agent_id.is_empty(), "route for {host} has an empty agent id");
            ensure_any!(!origin.is_empty(), "route for {host} has an empty origin");
            records.insert(
                host,
                RouteRecord {
                    agent_id: agent_id.to_string(),
                    origin: origin.to_string(),
                },
            );
        }
        Ok(Self { records })
    }

    /// The record for `host` as presented by the client, verbatim.
    pub fn lookup(&self, host: &str) -> Option<&RouteRecord> {
        self.records.get(host)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RouteRecord)> {
        self.records.iter().map(|(host, record)| (host.as_str(), record))
    }
}

impl FromIterator<(String, RouteRecord)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (String, RouteRecord)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_records() {
        let table = RouteTable::from_json(
            r#"{ "hrt.test": "edge-1:127.0.0.1:9001", "other": "edge-2:10.0.0.5:80" }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("hrt.test"),
            Some(&RouteRecord {
                agent_id: "edge-1".into(),
                origin: "127.0.0.1:9001".into(),
            })
        );
        assert!(table.lookup("missing").is_none());
    }

    #[test]
    fn the_first_colon_splits_id_from_origin() {
        let table = RouteTable::from_json(r#"{ "h": "a:b:c:d" }"#).unwrap();
        let record = table.lookup("h").unwrap();
        assert_eq!(record.agent_id, "a");
        assert_eq!(record.origin, "b:c:d");
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(RouteTable::from_json("not json").is_err());
        assert!(RouteTable::from_json(r#"{ "h": 3 }"#).is_err());
        assert!(RouteTable::from_json(r#"{ "h": "no-separator" }"#).is_err());
        assert!(RouteTable::from_json(r#"{ "h": ":9001" }"#).is_err());
        assert!(RouteTable::from_json(r#"{ "h": "edge-1:" }"#).is_err());
    }
}
