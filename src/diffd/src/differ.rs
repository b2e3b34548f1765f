// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Streaming differ for DOT-format flow graphs.
//!
//! The graphs this service consumes run to several gigabytes, so no graph is
//! ever parsed or buffered whole. Instead each source is streamed twice: one
//! pass records edge fingerprints and node lines, a second pass re-reads the
//! source and emits the surviving edge lines verbatim. Memory is bounded by
//! the fingerprint sets and the node map, not by the document size. The full
//! DOT grammar is likewise avoided in favor of line-level string handling;
//! the restricted dialect written by the upstream grapher makes that safe.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::diff::Diff;
use crate::grapher::{Grapher, GrapherError, GraphStream};

/// The set of keyed attributes of an edge. These are the values not expected
/// to change between graph generations; everything else (packet and byte
/// counts, timestamps, the label) is ignored for edge identity.
const KEY_ATTRS: [&str; 6] = [
    "govpc_accountID",
    "govpc_eniID",
    "govpc_srcPort",
    "govpc_dstPort",
    "govpc_protocol",
    "color", // red/green represents status reject/accept
];

/// An error produced while computing a diff.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Grapher(#[from] GrapherError),
    #[error("reading graph stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Computes the diff document for a descriptor's two windows.
#[async_trait]
pub trait Differ: Send + Sync {
    async fn diff(&self, diff: &Diff) -> Result<GraphStream, DiffError>;
}

/// A [`Differ`] over DOT graphs produced by a [`Grapher`].
pub struct DotDiffer {
    grapher: Arc<dyn Grapher>,
}

impl DotDiffer {
    pub fn new(grapher: Arc<dyn Grapher>) -> DotDiffer {
        DotDiffer { grapher }
    }
}

#[async_trait]
impl Differ for DotDiffer {
    async fn diff(&self, diff: &Diff) -> Result<GraphStream, DiffError> {
        // Each window is fetched twice; the grapher upstream is idempotent
        // (202 or 409 for identical windows), so the four jobs collapse to
        // two upstream graphs.
        let (previous, previous_source, next, next_source) = futures::try_join!(
            self.grapher.graph(diff.previous_start, diff.previous_stop),
            self.grapher.graph(diff.previous_start, diff.previous_stop),
            self.grapher.graph(diff.next_start, diff.next_stop),
            self.grapher.graph(diff.next_start, diff.next_stop),
        )?;

        let mut nodes = BTreeMap::new();
        let mut previous_edges = HashSet::new();
        index_graph(previous, &mut nodes, &mut previous_edges).await?;
        let mut next_edges = HashSet::new();
        index_graph(next, &mut nodes, &mut next_edges).await?;

        let mut output = String::from("digraph {\n");
        let mut live_nodes = BTreeSet::new();
        emit_tagged(next_source, &previous_edges, Tag::Added, &mut output, &mut live_nodes)
            .await?;
        emit_tagged(previous_source, &next_edges, Tag::Removed, &mut output, &mut live_nodes)
            .await?;
        for node in &live_nodes {
            if let Some(line) = nodes.get(node) {
                output.push_str(line);
                output.push('\n');
            }
        }
        output.push('}');

        Ok(Box::pin(Cursor::new(output.into_bytes())))
    }
}

#[derive(Clone, Copy)]
enum Tag {
    Added,
    Removed,
}

impl Tag {
    fn as_str(self) -> &'static str {
        match self {
            Tag::Added => "ADDED",
            Tag::Removed => "REMOVED",
        }
    }
}

enum Line<'a> {
    Node { id: &'a str },
    Edge { key: String, from: &'a str, to: &'a str },
}

/// Classifies a trimmed, non-empty line. A line is an edge iff it contains
/// the `->` token; everything else, the `digraph {` header and `}` footer
/// included, is treated as a node. Classification is deliberately cheap and
/// best-effort; corrupted input may misclassify.
fn classify(line: &str) -> Line<'_> {
    if line.contains("->") {
        edge_line(line)
    } else {
        Line::Node {
            id: line.split(' ').next().unwrap_or(line),
        }
    }
}

/// Derives an edge's identity key. The source format looks like:
///
/// ```text
/// n17 -> n21 [govpc_accountID="1234" govpc_srcPort="0" govpc_packets="20" color=red label="..."]
/// ```
///
/// and the key is the two endpoints followed by the keyed attributes in
/// sorted order, here `n17n21color=redgovpc_accountID="1234"govpc_srcPort="0"`.
fn edge_line(line: &str) -> Line<'_> {
    let mut parts = line.splitn(4, ' ');
    let from = parts.next().unwrap_or("");
    let _arrow = parts.next();
    let to = parts.next().unwrap_or("");
    let attrs = parts.next().unwrap_or("");
    let attrs = attrs.strip_prefix('[').unwrap_or(attrs);
    let attrs = attrs.strip_suffix(']').unwrap_or(attrs);
    let mut selected: Vec<&str> = attrs
        .split(' ')
        .filter(|attr| {
            let name = attr.split('=').next().unwrap_or("");
            KEY_ATTRS.contains(&name)
        })
        .collect();
    selected.sort_unstable();
    let mut key = String::with_capacity(from.len() + to.len() + selected.iter().map(|a| a.len()).sum::<usize>());
    key.push_str(from);
    key.push_str(to);
    for attr in selected {
        key.push_str(attr);
    }
    Line::Edge { key, from, to }
}

/// One fingerprinting pass: records every node line keyed by node id and
/// every edge fingerprint. Duplicate fingerprints collapse into the set.
async fn index_graph(
    graph: GraphStream,
    nodes: &mut BTreeMap<String, String>,
    edges: &mut HashSet<String>,
) -> Result<(), DiffError> {
    let mut lines = BufReader::new(graph).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match classify(line) {
            Line::Node { id } => {
                nodes.insert(id.to_string(), line.to_string());
            }
            Line::Edge { key, .. } => {
                edges.insert(key);
            }
        }
    }
    Ok(())
}

/// One emitting pass: re-reads a source and emits every edge whose
/// fingerprint is absent from `other`, rewritten to carry `tag` both in the
/// human-readable label and as a `govpc_diff` attribute. Both endpoints of
/// every emitted edge are recorded in `live_nodes`.
async fn emit_tagged(
    source: GraphStream,
    other: &HashSet<String>,
    tag: Tag,
    output: &mut String,
    live_nodes: &mut BTreeSet<String>,
) -> Result<(), DiffError> {
    let mut lines = BufReader::new(source).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Line::Edge { key, from, to } = classify(line) {
            if !other.contains(&key) {
                live_nodes.insert(from.to_string());
                live_nodes.insert(to.to_string());
                // `...label="..."]` becomes `...label="...\ndiff=TAG" govpc_diff="TAG"]`.
                output.push_str(line.strip_suffix("\"]").unwrap_or(line));
                output.push_str("\\ndiff=");
                output.push_str(tag.as_str());
                output.push_str("\" govpc_diff=\"");
                output.push_str(tag.as_str());
                output.push_str("\"]\n");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct StaticGrapher {
        previous_start: DateTime<Utc>,
        previous: String,
        next: String,
    }

    #[async_trait]
    impl Grapher for StaticGrapher {
        async fn graph(
            &self,
            start: DateTime<Utc>,
            _stop: DateTime<Utc>,
        ) -> Result<GraphStream, GrapherError> {
            let graph = if start == self.previous_start {
                self.previous.clone()
            } else {
                self.next.clone()
            };
            Ok(Box::pin(Cursor::new(graph.into_bytes())))
        }
    }

    struct FailingGrapher {
        previous_start: DateTime<Utc>,
        fail_previous: bool,
    }

    #[async_trait]
    impl Grapher for FailingGrapher {
        async fn graph(
            &self,
            start: DateTime<Utc>,
            _stop: DateTime<Utc>,
        ) -> Result<GraphStream, GrapherError> {
            if (start == self.previous_start) == self.fail_previous {
                Err(GrapherError::UnexpectedStatus {
                    status: http::StatusCode::INTERNAL_SERVER_ERROR,
                    body: String::new(),
                })
            } else {
                Ok(Box::pin(Cursor::new(Vec::new())))
            }
        }
    }

    fn descriptor() -> Diff {
        Diff::from_windows(
            Utc.with_ymd_and_hms(2018, 12, 1, 8, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2018, 12, 1, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2018, 12, 1, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2018, 12, 1, 10, 0, 0).unwrap(),
        )
        .unwrap()
    }

    async fn run_diff(previous: &str, next: &str) -> BTreeSet<String> {
        let diff = descriptor();
        let differ = DotDiffer::new(Arc::new(StaticGrapher {
            previous_start: diff.previous_start,
            previous: previous.to_string(),
            next: next.to_string(),
        }));
        let mut out = String::new();
        differ
            .diff(&diff)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        out.lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    const BASE_EDGES: &str = r#"n1723116139 -> n172311621 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="0" govpc_dstPort="80" govpc_protocol="6" govpc_packets="20" govpc_bytes="1000" govpc_start="1418530010" govpc_end="1818530070" color=red label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=0\ndstPort=80\nprotocol=6\npackets=20\nbytes=1000\nstart=1418530010\nend=1818530070"]
n1723116139 -> n172311621 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="0" govpc_dstPort="80" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=0\ndstPort=80\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]
n172311621 -> n1723116139 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="80" govpc_dstPort="0" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=80\ndstPort=0\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]"#;

    const EXTRA_NODE_EDGES: &str = r#"n172311621 -> n172311622 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="0" govpc_dstPort="80" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=80\ndstPort=0\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]
n172311622 -> n172311621 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="80" govpc_dstPort="0" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=80\ndstPort=0\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]"#;

    const EXTRA_PORT_EDGES: &str = r#"n1723116139 -> n172311621 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="0" govpc_dstPort="22" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=0\ndstPort=80\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]
n172311621 -> n1723116139 [govpc_accountID="123456789010" govpc_eniID="eni-abc123de" govpc_srcPort="22" govpc_dstPort="0" govpc_protocol="6" govpc_packets="40" govpc_bytes="2000" govpc_start="1418530010" govpc_end="1818530070" color=green label="accountID=123456789010\neniID=eni-abc123de\nsrcPort=80\ndstPort=0\nprotocol=6\npackets=40\nbytes=2000\nstart=1418530010\nend=1818530070"]"#;

    const BASE_NODES: &str = "n1723116139 [label=\"172.31.16.139\"]\nn172311621 [label=\"172.31.16.21\"]";

    fn graph(edges: &[&str], nodes: &[&str]) -> String {
        let mut out = String::from("digraph {\n");
        for chunk in edges.iter().chain(nodes.iter()) {
            out.push_str(chunk);
            out.push('\n');
        }
        out.push('}');
        out
    }

    fn tagged(edges: &str, tag: &str) -> Vec<String> {
        edges
            .lines()
            .map(|line| {
                format!(
                    "{}\\ndiff={}\" govpc_diff=\"{}\"]",
                    line.trim_end_matches("\"]"),
                    tag,
                    tag
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn added_node() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let next = graph(
            &[BASE_EDGES, EXTRA_NODE_EDGES],
            &[BASE_NODES, "n172311622 [label=\"172.31.16.22\"]"],
        );
        let mut expected: BTreeSet<String> = ["digraph {", "}"]
            .into_iter()
            .map(String::from)
            .collect();
        expected.extend(tagged(EXTRA_NODE_EDGES, "ADDED"));
        expected.insert("n172311621 [label=\"172.31.16.21\"]".into());
        expected.insert("n172311622 [label=\"172.31.16.22\"]".into());
        assert_eq!(run_diff(&previous, &next).await, expected);
    }

    #[tokio::test]
    async fn added_port() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let next = graph(&[BASE_EDGES, EXTRA_PORT_EDGES], &[BASE_NODES]);
        let mut expected: BTreeSet<String> = ["digraph {", "}"]
            .into_iter()
            .map(String::from)
            .collect();
        expected.extend(tagged(EXTRA_PORT_EDGES, "ADDED"));
        expected.insert("n1723116139 [label=\"172.31.16.139\"]".into());
        expected.insert("n172311621 [label=\"172.31.16.21\"]".into());
        assert_eq!(run_diff(&previous, &next).await, expected);
    }

    #[tokio::test]
    async fn removed_node() {
        let previous = graph(
            &[BASE_EDGES, EXTRA_NODE_EDGES],
            &[BASE_NODES, "n172311622 [label=\"172.31.16.22\"]"],
        );
        let next = graph(&[BASE_EDGES], &[BASE_NODES]);
        let mut expected: BTreeSet<String> = ["digraph {", "}"]
            .into_iter()
            .map(String::from)
            .collect();
        expected.extend(tagged(EXTRA_NODE_EDGES, "REMOVED"));
        expected.insert("n172311621 [label=\"172.31.16.21\"]".into());
        expected.insert("n172311622 [label=\"172.31.16.22\"]".into());
        assert_eq!(run_diff(&previous, &next).await, expected);
    }

    #[tokio::test]
    async fn removed_port() {
        let previous = graph(&[BASE_EDGES, EXTRA_PORT_EDGES], &[BASE_NODES]);
        let next = graph(&[BASE_EDGES], &[BASE_NODES]);
        let mut expected: BTreeSet<String> = ["digraph {", "}"]
            .into_iter()
            .map(String::from)
            .collect();
        expected.extend(tagged(EXTRA_PORT_EDGES, "REMOVED"));
        expected.insert("n1723116139 [label=\"172.31.16.139\"]".into());
        expected.insert("n172311621 [label=\"172.31.16.21\"]".into());
        assert_eq!(run_diff(&previous, &next).await, expected);
    }

    #[tokio::test]
    async fn identical_graphs_produce_an_empty_diff() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let diff = run_diff(&previous, &previous).await;
        let expected: BTreeSet<String> =
            ["digraph {", "}"].into_iter().map(String::from).collect();
        assert_eq!(diff, expected);
    }

    #[tokio::test]
    async fn swapping_arguments_swaps_tags() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let next = graph(&[BASE_EDGES, EXTRA_PORT_EDGES], &[BASE_NODES]);
        let forward = run_diff(&previous, &next).await;
        let backward = run_diff(&next, &previous).await;
        let swapped: BTreeSet<String> = backward
            .into_iter()
            .map(|line| {
                if line.contains("REMOVED") {
                    line.replace("REMOVED", "ADDED")
                } else {
                    line.replace("ADDED", "REMOVED")
                }
            })
            .collect();
        assert_eq!(forward, swapped);
    }

    #[tokio::test]
    async fn non_key_attribute_changes_produce_no_diff() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let recounted = BASE_EDGES
            .replace("govpc_packets=\"20\"", "govpc_packets=\"99\"")
            .replace("govpc_bytes=\"2000\"", "govpc_bytes=\"1\"")
            .replace("govpc_start=\"1418530010\"", "govpc_start=\"1518530010\"");
        let next = graph(&[recounted.as_str()], &[BASE_NODES]);
        let diff = run_diff(&previous, &next).await;
        let expected: BTreeSet<String> =
            ["digraph {", "}"].into_iter().map(String::from).collect();
        assert_eq!(diff, expected);
    }

    #[tokio::test]
    async fn emitted_nodes_equal_endpoints_of_emitted_edges() {
        let previous = graph(&[BASE_EDGES], &[BASE_NODES]);
        let next = graph(
            &[BASE_EDGES, EXTRA_NODE_EDGES],
            &[BASE_NODES, "n172311622 [label=\"172.31.16.22\"]"],
        );
        let diff = run_diff(&previous, &next).await;
        let mut edge_endpoints = BTreeSet::new();
        let mut emitted_nodes = BTreeSet::new();
        for line in &diff {
            if line == "digraph {" || line == "}" {
                continue;
            }
            if line.contains("->") {
                let mut parts = line.splitn(4, ' ');
                edge_endpoints.insert(parts.next().unwrap().to_string());
                parts.next();
                edge_endpoints.insert(parts.next().unwrap().to_string());
            } else {
                emitted_nodes.insert(line.split(' ').next().unwrap().to_string());
            }
        }
        assert_eq!(edge_endpoints, emitted_nodes);
    }

    #[tokio::test]
    async fn previous_graph_error_propagates() {
        let diff = descriptor();
        let differ = DotDiffer::new(Arc::new(FailingGrapher {
            previous_start: diff.previous_start,
            fail_previous: true,
        }));
        assert!(differ.diff(&diff).await.is_err());
    }

    #[tokio::test]
    async fn next_graph_error_propagates() {
        let diff = descriptor();
        let differ = DotDiffer::new(Arc::new(FailingGrapher {
            previous_start: diff.previous_start,
            fail_previous: false,
        }));
        assert!(differ.diff(&diff).await.is_err());
    }

    proptest::proptest! {
        // Randomized edges against an oracle set-difference on the identity
        // attributes.
        #[test]
        fn diff_matches_oracle_set_difference(
            previous in proptest::collection::hash_set((0u8..5, 0u8..5, 0u16..4, 0u16..4), 0..12),
            next in proptest::collection::hash_set((0u8..5, 0u8..5, 0u16..4, 0u16..4), 0..12),
        ) {
            let render = |(from, to, src, dst): &(u8, u8, u16, u16)| {
                format!(
                    "n{} -> n{} [govpc_accountID=\"1\" govpc_eniID=\"eni-1\" govpc_srcPort=\"{}\" govpc_dstPort=\"{}\" govpc_protocol=\"6\" govpc_packets=\"9\" label=\"x\"]",
                    from, to, src, dst
                )
            };
            let previous_doc = {
                let lines: Vec<String> = previous.iter().map(render).collect();
                format!("digraph {{\n{}\n}}", lines.join("\n"))
            };
            let next_doc = {
                let lines: Vec<String> = next.iter().map(render).collect();
                format!("digraph {{\n{}\n}}", lines.join("\n"))
            };
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let diff = rt.block_on(run_diff(&previous_doc, &next_doc));
            let added = diff.iter().filter(|l| l.contains("govpc_diff=\"ADDED\"")).count();
            let removed = diff.iter().filter(|l| l.contains("govpc_diff=\"REMOVED\"")).count();
            proptest::prop_assert_eq!(added, next.difference(&previous).count());
            proptest::prop_assert_eq!(removed, previous.difference(&next).count());
        }
    }
}
