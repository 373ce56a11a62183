//! Knowledge graph over typed edges between knowledge units.
//!
//! Edges are rows, not pointers; cycles are legal data and detected by an
//! explicit algorithm rather than being a runtime hazard.

use crate::core::error::EngineError;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{params, Connection};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const EDGE_ID_PREFIX: &str = "edg";

/// Structural relations extracted from code facts.
pub const STRUCTURAL_RELATIONS: &[&str] = &[
    "inherits",
    "implements",
    "calls",
    "depends_on",
    "data_flow_to",
    "references",
];

/// Semantic relations curated by reviewers.
pub const SEMANTIC_RELATIONS: &[&str] = &[
    "extends",
    "conflicts",
    "related",
    "alternative",
    "prerequisite",
    "deprecated_by",
    "solves",
    "enforces",
];

/// Relations that participate in dependency queries and cycle detection.
pub const DEPENDENCY_RELATIONS: &[&str] = &["depends_on", "requires", "prerequisite"];

pub const PAGERANK_ITERATIONS: usize = 10;
pub const PAGERANK_DAMPING: f64 = 0.85;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEdge {
    pub id: String,
    pub from_id: String,
    pub from_type: String,
    pub to_id: String,
    pub to_type: String,
    pub relation: String,
    pub weight: f64,
    #[serde(default)]
    pub metadata: JsonValue,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Both,
}

impl Direction {
    pub fn parse(raw: &str) -> Result<Direction, EngineError> {
        match raw {
            "out" => Ok(Direction::Out),
            "in" => Ok(Direction::In),
            "both" => Ok(Direction::Both),
            other => Err(EngineError::Validation(format!(
                "invalid direction '{}'. Expected out|in|both",
                other
            ))),
        }
    }
}

/// A neighbor hit with the edge that reached it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub entity_id: String,
    pub entity_type: String,
    pub relation: String,
    pub weight: f64,
    pub depth: usize,
}

fn valid_relation(relation: &str) -> bool {
    STRUCTURAL_RELATIONS.contains(&relation)
        || SEMANTIC_RELATIONS.contains(&relation)
        || relation == "requires"
}

/// Insert an edge; idempotent on `(from, from_type, to, to_type, relation)`.
pub fn add_edge(
    conn: &Connection,
    from_id: &str,
    from_type: &str,
    to_id: &str,
    to_type: &str,
    relation: &str,
    weight: Option<f64>,
    metadata: Option<JsonValue>,
) -> Result<KnowledgeEdge, EngineError> {
    if !valid_relation(relation) {
        return Err(EngineError::Validation(format!(
            "unknown edge relation '{}'",
            relation
        )));
    }
    if from_id == to_id && from_type == to_type {
        return Err(EngineError::Validation(format!(
            "self edge on {} is not allowed",
            from_id
        )));
    }
    let edge = KnowledgeEdge {
        id: crate::core::paths::new_id(EDGE_ID_PREFIX),
        from_id: from_id.to_string(),
        from_type: from_type.to_string(),
        to_id: to_id.to_string(),
        to_type: to_type.to_string(),
        relation: relation.to_string(),
        weight: weight.unwrap_or(1.0),
        metadata: metadata.unwrap_or(JsonValue::Null),
        created_at: time::now_epoch_z(),
    };
    conn.execute(
        "INSERT OR IGNORE INTO knowledge_edges(id, from_id, from_type, to_id, to_type, relation,
             weight, metadata_json, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            edge.id,
            edge.from_id,
            edge.from_type,
            edge.to_id,
            edge.to_type,
            edge.relation,
            edge.weight,
            edge.metadata.to_string(),
            edge.created_at,
        ],
    )?;
    Ok(edge)
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeEdge> {
    let metadata_raw: String = row.get(7)?;
    Ok(KnowledgeEdge {
        id: row.get(0)?,
        from_id: row.get(1)?,
        from_type: row.get(2)?,
        to_id: row.get(3)?,
        to_type: row.get(4)?,
        relation: row.get(5)?,
        weight: row.get(6)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(JsonValue::Null),
        created_at: row.get(8)?,
    })
}

pub fn all_edges(conn: &Connection) -> Result<Vec<KnowledgeEdge>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, from_id, from_type, to_id, to_type, relation, weight, metadata_json,
                created_at
         FROM knowledge_edges ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map([], row_to_edge)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn edges_touching(conn: &Connection, id: &str) -> Result<Vec<KnowledgeEdge>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, from_id, from_type, to_id, to_type, relation, weight, metadata_json,
                created_at
         FROM knowledge_edges WHERE from_id = ?1 OR to_id = ?1",
    )?;
    let rows = stmt.query_map([id], row_to_edge)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Breadth-first neighborhood walk up to `depth` hops.
pub fn neighbors(
    conn: &Connection,
    id: &str,
    direction: Direction,
    relations: Option<&[&str]>,
    depth: usize,
) -> Result<Vec<Neighbor>, EngineError> {
    let depth = depth.max(1);
    let mut seen: FxHashSet<String> = FxHashSet::default();
    seen.insert(id.to_string());
    let mut frontier = vec![id.to_string()];
    let mut out = Vec::new();

    for hop in 1..=depth {
        let mut next = Vec::new();
        for node in &frontier {
            for edge in edges_touching(conn, node)? {
                if let Some(filter) = relations {
                    if !filter.contains(&edge.relation.as_str()) {
                        continue;
                    }
                }
                let (target_id, target_type, follows) = if edge.from_id == *node {
                    (
                        edge.to_id.clone(),
                        edge.to_type.clone(),
                        matches!(direction, Direction::Out | Direction::Both),
                    )
                } else {
                    (
                        edge.from_id.clone(),
                        edge.from_type.clone(),
                        matches!(direction, Direction::In | Direction::Both),
                    )
                };
                if !follows || seen.contains(&target_id) {
                    continue;
                }
                seen.insert(target_id.clone());
                next.push(target_id.clone());
                out.push(Neighbor {
                    entity_id: target_id,
                    entity_type: target_type,
                    relation: edge.relation.clone(),
                    weight: edge.weight,
                    depth: hop,
                });
            }
        }
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }
    Ok(out)
}

/// Out-neighbors over the dependency relation set.
pub fn dependencies(conn: &Connection, id: &str) -> Result<Vec<Neighbor>, EngineError> {
    neighbors(conn, id, Direction::Out, Some(DEPENDENCY_RELATIONS), 1)
}

/// In-neighbors over the dependency relation set.
pub fn used_by(conn: &Connection, id: &str) -> Result<Vec<Neighbor>, EngineError> {
    neighbors(conn, id, Direction::In, Some(DEPENDENCY_RELATIONS), 1)
}

/// Alternatives are symmetric regardless of edge direction.
pub fn alternatives(conn: &Connection, id: &str) -> Result<Vec<Neighbor>, EngineError> {
    neighbors(conn, id, Direction::Both, Some(&["alternative"]), 1)
}

/// Weighted neighborhood ordered by edge weight, then target PageRank.
pub fn related(
    conn: &Connection,
    id: &str,
    max_results: usize,
) -> Result<Vec<Neighbor>, EngineError> {
    let mut hits = neighbors(conn, id, Direction::Both, None, 1)?;
    let ranks = load_pagerank(conn)?;
    hits.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ra = ranks.get(&a.entity_id).copied().unwrap_or(0.0);
                let rb = ranks.get(&b.entity_id).copied().unwrap_or(0.0);
                rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.truncate(max_results);
    Ok(hits)
}

/// All strongly connected components of size > 1 over the dependency
/// relations (iterative Tarjan).
pub fn detect_cycles(conn: &Connection) -> Result<Vec<Vec<String>>, EngineError> {
    let edges = all_edges(conn)?;
    let mut adjacency: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut nodes: FxHashSet<String> = FxHashSet::default();
    for edge in &edges {
        if !DEPENDENCY_RELATIONS.contains(&edge.relation.as_str()) {
            continue;
        }
        nodes.insert(edge.from_id.clone());
        nodes.insert(edge.to_id.clone());
        adjacency
            .entry(edge.from_id.clone())
            .or_default()
            .push(edge.to_id.clone());
    }

    let mut index_of: FxHashMap<String, usize> = FxHashMap::default();
    let mut lowlink: FxHashMap<String, usize> = FxHashMap::default();
    let mut on_stack: FxHashSet<String> = FxHashSet::default();
    let mut stack: Vec<String> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<String>> = Vec::new();

    // Iterative Tarjan; the explicit frame stack holds (node, child cursor).
    let mut node_list: Vec<String> = nodes.iter().cloned().collect();
    node_list.sort();
    for start in node_list {
        if index_of.contains_key(&start) {
            continue;
        }
        let mut call_stack: Vec<(String, usize)> = vec![(start.clone(), 0)];
        while let Some((node, cursor)) = call_stack.pop() {
            if cursor == 0 {
                index_of.insert(node.clone(), next_index);
                lowlink.insert(node.clone(), next_index);
                next_index += 1;
                stack.push(node.clone());
                on_stack.insert(node.clone());
            }
            let children = adjacency.get(&node).cloned().unwrap_or_default();
            let mut advanced = false;
            for (child_pos, child) in children.iter().enumerate().skip(cursor) {
                if !index_of.contains_key(child) {
                    call_stack.push((node.clone(), child_pos + 1));
                    call_stack.push((child.clone(), 0));
                    advanced = true;
                    break;
                } else if on_stack.contains(child) {
                    let child_index = index_of[child];
                    let low = lowlink[&node].min(child_index);
                    lowlink.insert(node.clone(), low);
                }
            }
            if advanced {
                continue;
            }
            if lowlink[&node] == index_of[&node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack.remove(&member);
                    let done = member == node;
                    component.push(member);
                    if done {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort();
                    components.push(component);
                }
            }
            if let Some((parent, _)) = call_stack.last() {
                let low = lowlink[parent].min(lowlink[&node]);
                lowlink.insert(parent.clone(), low);
            }
        }
    }
    components.sort();
    Ok(components)
}

/// Recompute PageRank over the full edge set and persist the scores.
pub fn pagerank(
    conn: &Connection,
    iterations: usize,
    damping: f64,
) -> Result<FxHashMap<String, f64>, EngineError> {
    let edges = all_edges(conn)?;
    let mut nodes: FxHashSet<String> = FxHashSet::default();
    let mut outgoing: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for edge in &edges {
        nodes.insert(edge.from_id.clone());
        nodes.insert(edge.to_id.clone());
        outgoing
            .entry(edge.from_id.clone())
            .or_default()
            .push(edge.to_id.clone());
    }
    let n = nodes.len();
    if n == 0 {
        return Ok(FxHashMap::default());
    }

    let initial = 1.0 / n as f64;
    let mut ranks: FxHashMap<String, f64> =
        nodes.iter().map(|id| (id.clone(), initial)).collect();

    for _ in 0..iterations.max(1) {
        let mut next: FxHashMap<String, f64> = nodes
            .iter()
            .map(|id| (id.clone(), (1.0 - damping) / n as f64))
            .collect();
        // Dangling mass is spread uniformly so ranks keep summing to one.
        let mut dangling = 0.0;
        for node in &nodes {
            let rank = ranks[node];
            match outgoing.get(node) {
                Some(targets) if !targets.is_empty() => {
                    let share = damping * rank / targets.len() as f64;
                    for target in targets {
                        *next.get_mut(target).expect("target is a node") += share;
                    }
                }
                _ => dangling += rank,
            }
        }
        let dangling_share = damping * dangling / n as f64;
        for value in next.values_mut() {
            *value += dangling_share;
        }
        ranks = next;
    }

    let now = time::now_epoch_z();
    conn.execute("DELETE FROM pagerank", [])?;
    let mut sorted: Vec<(&String, &f64)> = ranks.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (entity_id, score) in sorted {
        conn.execute(
            "INSERT INTO pagerank(entity_id, score, computed_at) VALUES(?1, ?2, ?3)",
            params![entity_id, score, now],
        )?;
    }
    Ok(ranks)
}

pub fn load_pagerank(conn: &Connection) -> Result<FxHashMap<String, f64>, EngineError> {
    let mut stmt = conn.prepare("SELECT entity_id, score FROM pagerank")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut out = FxHashMap::default();
    for row in rows {
        let (id, score) = row?;
        out.insert(id, score);
    }
    Ok(out)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "graph", about = "Typed knowledge graph over recipes")]
pub struct GraphCli {
    #[clap(subcommand)]
    pub command: GraphCommand,
}

#[derive(Subcommand, Debug)]
pub enum GraphCommand {
    /// Add a typed edge between entities
    Link {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        #[clap(long)]
        relation: String,
        #[clap(long)]
        weight: Option<f64>,
    },
    /// Neighborhood of an entity
    Neighbors {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "both")]
        direction: String,
        #[clap(long, default_value = "1")]
        depth: usize,
    },
    /// Direct dependencies of an entity
    Deps {
        #[clap(long)]
        id: String,
    },
    /// Entities depending on this one
    UsedBy {
        #[clap(long)]
        id: String,
    },
    /// Detect dependency cycles
    Cycles,
    /// Recompute PageRank scores
    Pagerank {
        #[clap(long, default_value = "10")]
        iterations: usize,
    },
}

pub fn run_graph_cli(store: &crate::core::store::Store, cli: GraphCli) -> Result<(), EngineError> {
    let conn = crate::core::db::open_store_db(store)?;
    match cli.command {
        GraphCommand::Link {
            from,
            to,
            relation,
            weight,
        } => {
            let edge = add_edge(&conn, &from, "recipe", &to, "recipe", &relation, weight, None)?;
            println!("edge: {} -[{}]-> {}", edge.from_id, edge.relation, edge.to_id);
        }
        GraphCommand::Neighbors {
            id,
            direction,
            depth,
        } => {
            let direction = Direction::parse(&direction)?;
            for neighbor in neighbors(&conn, &id, direction, None, depth)? {
                println!(
                    "  {}  [{}]  depth={}  w={:.2}",
                    neighbor.entity_id, neighbor.relation, neighbor.depth, neighbor.weight
                );
            }
        }
        GraphCommand::Deps { id } => {
            for neighbor in dependencies(&conn, &id)? {
                println!("  {}  [{}]", neighbor.entity_id, neighbor.relation);
            }
        }
        GraphCommand::UsedBy { id } => {
            for neighbor in used_by(&conn, &id)? {
                println!("  {}  [{}]", neighbor.entity_id, neighbor.relation);
            }
        }
        GraphCommand::Cycles => {
            let cycles = detect_cycles(&conn)?;
            if cycles.is_empty() {
                println!("no dependency cycles");
            }
            for cycle in cycles {
                println!("  cycle: {}", cycle.join(" -> "));
            }
        }
        GraphCommand::Pagerank { iterations } => {
            let ranks = pagerank(&conn, iterations, PAGERANK_DAMPING)?;
            println!("pagerank: {} nodes scored", ranks.len());
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "graph",
        "version": "1.0.0",
        "description": "Typed edges between knowledge units with cycle detection and PageRank",
        "relations": {
            "structural": STRUCTURAL_RELATIONS,
            "semantic": SEMANTIC_RELATIONS,
            "dependency": DEPENDENCY_RELATIONS
        },
        "commands": [
            { "name": "link", "parameters": ["from", "to", "relation", "weight"] },
            { "name": "neighbors", "parameters": ["id", "direction", "depth"] },
            { "name": "deps", "parameters": ["id"] },
            { "name": "used-by", "parameters": ["id"] },
            { "name": "cycles", "parameters": [] },
            { "name": "pagerank", "parameters": ["iterations"] }
        ],
        "storage": ["autosnippet.db#knowledge_edges", "autosnippet.db#pagerank"]
    })
}
