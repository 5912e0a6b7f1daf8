//! Pattern queries over the graph
//!
//! A small, typed stand-in for Cypher `MATCH` clauses: lookup by id or
//! property, fixed-depth traversal, aggregate counts. Every pattern is
//! read-only and returns JSON rows.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde_json::{json, Value};

use super::schema::{NodeTable, RelKind};
use super::store::{EdgeRecord, GraphRead, NodeRecord, Properties};
use crate::error::Result;

/// One result row
pub type Row = serde_json::Map<String, Value>;

/// Edge direction for traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A query pattern
///
/// Property paths use dots to reach into nested objects, so
/// `metadata.project` reads the `project` key of a memory's metadata.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// `MATCH (n {id: $id}) RETURN n`
    NodeById { id: String },
    /// `MATCH (n:T) WHERE n.path = $value RETURN n`
    NodesByProperty {
        tables: Vec<NodeTable>,
        property: String,
        value: Value,
    },
    /// `MATCH (s {id: $start})-[:K*1..depth]-(n) RETURN n`
    Traverse {
        start: String,
        /// Relationship families to follow, empty for all
        kinds: Vec<RelKind>,
        direction: Direction,
        max_depth: usize,
    },
    /// `MATCH (n:T) RETURN [n.group,] count(n)`
    Count {
        tables: Vec<NodeTable>,
        group_by: Option<String>,
    },
    /// `MATCH (n:T) UNWIND n.path AS v RETURN DISTINCT v, count(*)`
    DistinctValues {
        tables: Vec<NodeTable>,
        property: String,
    },
    /// `MATCH (a)-[r:K]->(b) RETURN a, r, b`
    Edges {
        kind: Option<RelKind>,
        from: Option<String>,
        to: Option<String>,
    },
}

/// Execute a pattern against any reader
pub fn execute<R: GraphRead + ?Sized>(reader: &R, pattern: &Pattern) -> Result<Vec<Row>> {
    match pattern {
        Pattern::NodeById { id } => Ok(reader.get_node(id)?.map(node_row).into_iter().collect()),
        Pattern::NodesByProperty {
            tables,
            property,
            value,
        } => {
            let mut rows = Vec::new();
            for table in tables {
                for node in reader.scan_table(*table)? {
                    if lookup(&node.properties, property) == Some(value) {
                        rows.push(node_row(node));
                    }
                }
            }
            Ok(rows)
        }
        Pattern::Traverse {
            start,
            kinds,
            direction,
            max_depth,
        } => traverse(reader, start, kinds, *direction, *max_depth),
        Pattern::Count { tables, group_by } => count(reader, tables, group_by.as_deref()),
        Pattern::DistinctValues { tables, property } => distinct_values(reader, tables, property),
        Pattern::Edges { kind, from, to } => edges(reader, *kind, from.as_deref(), to.as_deref()),
    }
}

/// Resolve a dotted property path
pub fn lookup<'a>(properties: &'a Properties, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = properties.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn node_row(node: NodeRecord) -> Row {
    let mut row = node.properties;
    row.insert("_id".into(), Value::String(node.id));
    row.insert("_table".into(), Value::String(node.table.as_str().into()));
    row
}

fn edge_row(edge: &EdgeRecord) -> Row {
    let value = json!({
        "from": edge.from,
        "rel": edge.rel.name(),
        "to": edge.to,
        "weight": edge.props.weight,
        "relevance_score": edge.props.relevance_score,
        "context": edge.props.context,
        "timestamp": edge.props.timestamp,
    });
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

fn traverse<R: GraphRead + ?Sized>(
    reader: &R,
    start: &str,
    kinds: &[RelKind],
    direction: Direction,
    max_depth: usize,
) -> Result<Vec<Row>> {
    let follows = |kind: RelKind| kinds.is_empty() || kinds.contains(&kind);

    let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
    let mut queue: VecDeque<(String, usize, f32)> = VecDeque::from([(start.to_string(), 0, 1.0)]);
    let mut rows = Vec::new();

    while let Some((id, depth, weight)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }

        let mut steps: Vec<(String, &'static str, EdgeRecord)> = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for edge in reader.out_edges(&id, None)? {
                steps.push((edge.to.clone(), "out", edge));
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for edge in reader.in_edges(&id, None)? {
                steps.push((edge.from.clone(), "in", edge));
            }
        }

        for (next, dir, edge) in steps {
            if !follows(edge.rel.kind()) || !visited.insert(next.clone()) {
                continue;
            }
            let Some(table) = reader.table_of(&next)? else {
                continue;
            };
            let next_weight = weight * edge.props.traversal_weight();
            let mut row = Row::new();
            row.insert("id".into(), Value::String(next.clone()));
            row.insert("table".into(), Value::String(table.as_str().into()));
            row.insert("depth".into(), json!(depth + 1));
            row.insert("weight".into(), json!(next_weight));
            row.insert("via".into(), Value::String(edge.rel.name()));
            row.insert("direction".into(), Value::String(dir.into()));
            rows.push(row);
            queue.push_back((next, depth + 1, next_weight));
        }
    }

    Ok(rows)
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn count<R: GraphRead + ?Sized>(
    reader: &R,
    tables: &[NodeTable],
    group_by: Option<&str>,
) -> Result<Vec<Row>> {
    let Some(path) = group_by else {
        let mut total = 0;
        for table in tables {
            total += reader.count_table(*table)?;
        }
        let mut row = Row::new();
        row.insert("count".into(), json!(total));
        return Ok(vec![row]);
    };

    let mut groups: BTreeMap<String, (Value, usize)> = BTreeMap::new();
    for table in tables {
        for node in reader.scan_table(*table)? {
            let value = lookup(&node.properties, path).cloned().unwrap_or(Value::Null);
            groups.entry(value_key(&value)).or_insert((value, 0)).1 += 1;
        }
    }

    Ok(groups
        .into_values()
        .map(|(value, n)| {
            let mut row = Row::new();
            row.insert("group".into(), value);
            row.insert("count".into(), json!(n));
            row
        })
        .collect())
}

fn distinct_values<R: GraphRead + ?Sized>(
    reader: &R,
    tables: &[NodeTable],
    path: &str,
) -> Result<Vec<Row>> {
    let mut values: BTreeMap<String, usize> = BTreeMap::new();
    for table in tables {
        for node in reader.scan_table(*table)? {
            let Some(value) = lookup(&node.properties, path) else {
                continue;
            };
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                Value::Null => Vec::new(),
                other => vec![other],
            };
            for item in items {
                let key = value_key(item).trim().to_string();
                if !key.is_empty() {
                    *values.entry(key).or_insert(0) += 1;
                }
            }
        }
    }

    Ok(values
        .into_iter()
        .map(|(value, n)| {
            let mut row = Row::new();
            row.insert("value".into(), Value::String(value));
            row.insert("count".into(), json!(n));
            row
        })
        .collect())
}

fn edges<R: GraphRead + ?Sized>(
    reader: &R,
    kind: Option<RelKind>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<Row>> {
    let records = match (from, to) {
        (Some(from), _) => reader
            .out_edges(from, kind)?
            .into_iter()
            .filter(|e| to.map_or(true, |t| e.to == t))
            .collect(),
        (None, Some(to)) => reader.in_edges(to, kind)?,
        (None, None) => {
            let mut all = Vec::new();
            for (key, value) in reader.scan_raw(&super::schema::all_edges_prefix())? {
                let Some((from, rel, to)) = super::schema::split_edge_key(&key) else {
                    continue;
                };
                if kind.is_some_and(|k| k != rel.kind()) {
                    continue;
                }
                all.push(EdgeRecord {
                    rel,
                    from,
                    to,
                    props: bincode::deserialize(&value)?,
                });
            }
            all
        }
    };
    Ok(records.iter().map(edge_row).collect())
}
