use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::*;

/// Tunables for [`layout`]. Defaults come from the crate constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutOptions {
    pub node_width: f32,
    pub node_height: f32,
    pub rank_gap: f32,
    pub node_gap: f32,
    pub margin: f32,
    pub grid_columns: usize,
    pub barycenter_passes: usize,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            node_width: NODE_WIDTH,
            node_height: NODE_HEIGHT,
            rank_gap: RANK_GAP,
            node_gap: NODE_GAP,
            margin: LAYOUT_MARGIN,
            grid_columns: GRID_COLUMNS,
            barycenter_passes: DEFAULT_BARYCENTER_PASSES,
        }
    }
}

impl LayoutOptions {
    fn steps(&self, direction: LayoutDirection) -> (f32, f32) {
        match direction {
            LayoutDirection::LeftRight => (
                self.node_width + self.rank_gap,
                self.node_height + self.node_gap,
            ),
            _ => (
                self.node_height + self.rank_gap,
                self.node_width + self.node_gap,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub direction: LayoutDirection,
    /// Input nodes, in input order, with computed positions.
    pub nodes: Vec<GraphNode>,
    /// Rank of every node. Empty for grid layouts.
    pub ranks: BTreeMap<String, usize>,
    /// Node ids per rank (per row for grid layouts), in final order.
    pub layers: Vec<Vec<String>>,
    /// Edges ignored during ranking because they close a cycle.
    pub feedback_edges: Vec<String>,
    pub crossings: usize,
    pub passes: usize,
    pub size: CanvasSize,
}

impl Layout {
    pub fn rank(&self, node_id: &str) -> Option<usize> {
        self.ranks.get(node_id).copied()
    }

    pub fn position(&self, node_id: &str) -> Option<Point> {
        self.nodes
            .iter()
            .find(|node| node.id == node_id)
            .map(|node| node.position)
    }

    pub fn positions(&self) -> HashMap<String, Point> {
        self.nodes
            .iter()
            .map(|node| (node.id.clone(), node.position))
            .collect()
    }
}

/// A layout plus the edges it was computed from and the input repairs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutReport {
    #[serde(flatten)]
    pub layout: Layout,
    pub edges: Vec<GraphEdge>,
    pub diagnostics: GraphDiagnostics,
}

impl LayoutReport {
    pub fn new(parsed: ParsedGraph, direction: LayoutDirection, options: &LayoutOptions) -> Self {
        let layout = layout(&parsed.graph, direction, options);
        Self {
            layout,
            edges: parsed.graph.edges,
            diagnostics: parsed.diagnostics,
        }
    }
}

/// Positions `nodes` with default options and returns the updated copies.
pub fn layout_nodes(
    nodes: &[GraphNode],
    edges: &[GraphEdge],
    direction: LayoutDirection,
) -> Vec<GraphNode> {
    let graph = Graph::new(nodes.to_vec(), edges.to_vec());
    layout(&graph, direction, &LayoutOptions::default()).nodes
}

/// Layered layout of an already validated graph.
///
/// Pure: the same graph, direction and options always give the same result.
pub fn layout(graph: &Graph, direction: LayoutDirection, options: &LayoutOptions) -> Layout {
    if direction == LayoutDirection::Grid {
        return grid_layout(graph, options);
    }

    let indexed = IndexedGraph::new(graph);

    let (ranks, feedback) = assign_ranks(&indexed);
    let mut layers = build_layers(&ranks, indexed.len());
    let (up, down) = adjacent_neighbors(&indexed, &ranks);

    let (passes, crossings) = order_layers(&mut layers, &indexed, &up, &down, options);

    let (primary_step, secondary_step) = options.steps(direction);
    let widest = layers.iter().map(Vec::len).max().unwrap_or(0);
    let widest_span = secondary_step * widest.saturating_sub(1) as f32;

    let mut positions = vec![Point::default(); indexed.len()];
    for (rank, layer) in layers.iter().enumerate() {
        let span = secondary_step * layer.len().saturating_sub(1) as f32;
        let offset = (widest_span - span) / 2.0;
        let primary = options.margin + rank as f32 * primary_step;
        for (slot, &node) in layer.iter().enumerate() {
            let secondary = options.margin + offset + slot as f32 * secondary_step;
            positions[node] = match direction {
                LayoutDirection::LeftRight => Point::new(primary, secondary),
                _ => Point::new(secondary, primary),
            };
        }
    }

    let primary_extent = primary_step * layers.len().saturating_sub(1) as f32;
    let size = match direction {
        LayoutDirection::LeftRight => CanvasSize {
            width: options.margin * 2.0 + primary_extent + options.node_width,
            height: options.margin * 2.0 + widest_span + options.node_height,
        },
        _ => CanvasSize {
            width: options.margin * 2.0 + widest_span + options.node_width,
            height: options.margin * 2.0 + primary_extent + options.node_height,
        },
    };

    let nodes = graph
        .nodes
        .iter()
        .map(|node| {
            let mut placed = node.clone();
            if let Some(&idx) = indexed.index.get(node.id.as_str()) {
                placed.position = positions[idx];
            }
            placed
        })
        .collect();

    Layout {
        direction,
        nodes,
        ranks: indexed
            .ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.to_string(), ranks[idx]))
            .collect(),
        layers: layers
            .iter()
            .map(|layer| layer.iter().map(|&idx| indexed.ids[idx].to_string()).collect())
            .collect(),
        feedback_edges: feedback
            .into_iter()
            .map(|edge| graph.edges[edge].id.clone())
            .collect(),
        crossings,
        passes,
        size,
    }
}

/// Counts pairwise crossings between consecutive layers.
pub fn count_crossings(layers: &[Vec<String>], edges: &[GraphEdge]) -> usize {
    let mut rank_of: HashMap<&str, (usize, usize)> = HashMap::new();
    for (rank, layer) in layers.iter().enumerate() {
        for (slot, id) in layer.iter().enumerate() {
            rank_of.insert(id.as_str(), (rank, slot));
        }
    }

    let mut segments: Vec<Vec<(usize, usize)>> = vec![Vec::new(); layers.len()];
    for edge in edges {
        let (Some(&(ra, sa)), Some(&(rb, sb))) = (
            rank_of.get(edge.source.as_str()),
            rank_of.get(edge.target.as_str()),
        ) else {
            continue;
        };
        if ra + 1 == rb {
            segments[ra].push((sa, sb));
        } else if rb + 1 == ra {
            segments[rb].push((sb, sa));
        }
    }

    segments.iter().map(|pairs| crossings_between(pairs)).sum()
}

struct IndexedGraph<'a> {
    ids: Vec<&'a str>,
    index: HashMap<&'a str, usize>,
    /// (source, target, edge position) for edges with known endpoints, self loops excluded.
    edges: Vec<(usize, usize, usize)>,
}

impl<'a> IndexedGraph<'a> {
    fn new(graph: &'a Graph) -> Self {
        let mut ids = Vec::with_capacity(graph.nodes.len());
        let mut index = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if !index.contains_key(node.id.as_str()) {
                index.insert(node.id.as_str(), ids.len());
                ids.push(node.id.as_str());
            }
        }

        let edges = graph
            .edges
            .iter()
            .enumerate()
            .filter_map(|(pos, edge)| {
                let source = *index.get(edge.source.as_str())?;
                let target = *index.get(edge.target.as_str())?;
                (source != target).then_some((source, target, pos))
            })
            .collect();

        Self { ids, index, edges }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Longest-path ranking. Edges closing a cycle, found by a depth-first
/// search that starts from sources in insertion order, are set aside.
fn assign_ranks(graph: &IndexedGraph<'_>) -> (Vec<usize>, Vec<usize>) {
    let count = graph.len();
    let mut outgoing: Vec<Vec<(usize, usize)>> = vec![Vec::new(); count];
    let mut indegree = vec![0_usize; count];
    for (edge_idx, &(source, target, _)) in graph.edges.iter().enumerate() {
        outgoing[source].push((target, edge_idx));
        indegree[target] += 1;
    }

    let roots: Vec<usize> = (0..count)
        .filter(|&node| indegree[node] == 0)
        .chain((0..count).filter(|&node| indegree[node] > 0))
        .collect();

    const UNSEEN: u8 = 0;
    const ACTIVE: u8 = 1;
    const DONE: u8 = 2;
    let mut state = vec![UNSEEN; count];
    let mut is_feedback = vec![false; graph.edges.len()];

    for root in roots {
        if state[root] != UNSEEN {
            continue;
        }
        state[root] = ACTIVE;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            if let Some(&(target, edge_idx)) = outgoing[node].get(cursor) {
                frame.1 += 1;
                match state[target] {
                    ACTIVE => is_feedback[edge_idx] = true,
                    UNSEEN => {
                        state[target] = ACTIVE;
                        stack.push((target, 0));
                    }
                    _ => {}
                }
            } else {
                state[node] = DONE;
                stack.pop();
            }
        }
    }

    let mut dag_indegree = vec![0_usize; count];
    for (edge_idx, &(_, target, _)) in graph.edges.iter().enumerate() {
        if !is_feedback[edge_idx] {
            dag_indegree[target] += 1;
        }
    }

    let mut ranks = vec![0_usize; count];
    let mut queue: VecDeque<usize> = (0..count).filter(|&node| dag_indegree[node] == 0).collect();
    while let Some(node) = queue.pop_front() {
        for &(target, edge_idx) in &outgoing[node] {
            if is_feedback[edge_idx] {
                continue;
            }
            ranks[target] = ranks[target].max(ranks[node] + 1);
            dag_indegree[target] -= 1;
            if dag_indegree[target] == 0 {
                queue.push_back(target);
            }
        }
    }

    let feedback = graph
        .edges
        .iter()
        .enumerate()
        .filter(|(edge_idx, _)| is_feedback[*edge_idx])
        .map(|(_, &(_, _, pos))| pos)
        .collect();

    (ranks, feedback)
}

fn build_layers(ranks: &[usize], count: usize) -> Vec<Vec<usize>> {
    let depth = ranks.iter().copied().max().map_or(0, |max| max + 1);
    let mut layers = vec![Vec::new(); depth];
    for node in 0..count {
        layers[ranks[node]].push(node);
    }
    layers
}

/// Neighbours one rank above (`up`) and one rank below (`down`) each node.
fn adjacent_neighbors(
    graph: &IndexedGraph<'_>,
    ranks: &[usize],
) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let mut up = vec![Vec::new(); graph.len()];
    let mut down = vec![Vec::new(); graph.len()];
    for &(source, target, _) in &graph.edges {
        if ranks[source] + 1 == ranks[target] {
            up[target].push(source);
            down[source].push(target);
        } else if ranks[target] + 1 == ranks[source] {
            up[source].push(target);
            down[target].push(source);
        }
    }
    (up, down)
}

/// Barycenter sweeps, down then up, until a pass changes nothing or the
/// pass budget runs out. Keeps the ordering with the fewest crossings.
fn order_layers(
    layers: &mut Vec<Vec<usize>>,
    graph: &IndexedGraph<'_>,
    up: &[Vec<usize>],
    down: &[Vec<usize>],
    options: &LayoutOptions,
) -> (usize, usize) {
    let mut slot = vec![0_usize; graph.len()];
    for layer in layers.iter() {
        for (idx, &node) in layer.iter().enumerate() {
            slot[node] = idx;
        }
    }

    let mut best = layers.clone();
    let mut best_crossings = layer_crossings(layers, &slot, up);
    let mut passes = 0;

    for _ in 0..options.barycenter_passes {
        passes += 1;
        let mut changed = false;

        for rank in 1..layers.len() {
            changed |= sort_by_barycenter(&mut layers[rank], up, &mut slot);
        }
        for rank in (0..layers.len().saturating_sub(1)).rev() {
            changed |= sort_by_barycenter(&mut layers[rank], down, &mut slot);
        }

        let crossings = layer_crossings(layers, &slot, up);
        if crossings < best_crossings {
            best = layers.clone();
            best_crossings = crossings;
        }

        if !changed {
            break;
        }
    }

    *layers = best;
    (passes, best_crossings)
}

fn sort_by_barycenter(layer: &mut [usize], neighbors: &[Vec<usize>], slot: &mut [usize]) -> bool {
    let score = |node: usize| -> f64 {
        let adjacent = &neighbors[node];
        if adjacent.is_empty() {
            return slot[node] as f64;
        }
        adjacent.iter().map(|&n| slot[n] as f64).sum::<f64>() / adjacent.len() as f64
    };

    let scores: HashMap<usize, f64> = layer.iter().map(|&node| (node, score(node))).collect();
    let before = layer.to_vec();
    layer.sort_by(|a, b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(Ordering::Equal)
    });

    for (idx, &node) in layer.iter().enumerate() {
        slot[node] = idx;
    }
    before != layer
}

fn layer_crossings(layers: &[Vec<usize>], slot: &[usize], up: &[Vec<usize>]) -> usize {
    layers
        .iter()
        .skip(1)
        .map(|layer| {
            let pairs: Vec<(usize, usize)> = layer
                .iter()
                .flat_map(|&node| up[node].iter().map(move |&parent| (parent, node)))
                .map(|(parent, node)| (slot[parent], slot[node]))
                .collect();
            crossings_between(&pairs)
        })
        .sum()
}

fn crossings_between(pairs: &[(usize, usize)]) -> usize {
    let mut crossings = 0;
    for (i, &(a1, b1)) in pairs.iter().enumerate() {
        for &(a2, b2) in &pairs[i + 1..] {
            if (a1 < a2 && b1 > b2) || (a1 > a2 && b1 < b2) {
                crossings += 1;
            }
        }
    }
    crossings
}

fn grid_layout(graph: &Graph, options: &LayoutOptions) -> Layout {
    let columns = options.grid_columns.max(1);
    let column_step = options.node_width + options.node_gap;
    let row_step = options.node_height + options.rank_gap;

    let mut layers: Vec<Vec<String>> = Vec::new();
    let nodes: Vec<GraphNode> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| {
            let (row, column) = (idx / columns, idx % columns);
            if column == 0 {
                layers.push(Vec::new());
            }
            if let Some(layer) = layers.last_mut() {
                layer.push(node.id.clone());
            }
            let mut placed = node.clone();
            placed.position = Point::new(
                options.margin + column as f32 * column_step,
                options.margin + row as f32 * row_step,
            );
            placed
        })
        .collect();

    let used_columns = graph.nodes.len().min(columns);
    let rows = layers.len();
    let size = CanvasSize {
        width: options.margin * 2.0
            + column_step * used_columns.saturating_sub(1) as f32
            + options.node_width,
        height: options.margin * 2.0
            + row_step * rows.saturating_sub(1) as f32
            + options.node_height,
    };

    Layout {
        direction: LayoutDirection::Grid,
        nodes,
        ranks: BTreeMap::new(),
        layers,
        feedback_edges: Vec::new(),
        crossings: 0,
        passes: 0,
        size,
    }
}
