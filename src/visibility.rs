//! Visibility projection over a collapsible hierarchy
//!
//! The hierarchy is read from hierarchy edges (source = parent, target = child)
//! and from each node's optional `parent` link. It is stored as an arena of
//! integer-indexed nodes with parent/child index lists, so cyclic input is
//! traversed with a visited mask and always terminates.
//!
//! A node is hidden when it, or any of its ancestors along any path, is
//! collapsed. An edge is visible iff both of its endpoints are visible.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::graph_types::{Edge, EdgeId, Node, NodeId};

/// Set of collapsed node ids; inserting an id twice is a no-op
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapsedSet {
    ids: BTreeSet<NodeId>,
}

impl CollapsedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse `id`; returns false if it was already collapsed
    pub fn insert(&mut self, id: impl Into<NodeId>) -> bool {
        self.ids.insert(id.into())
    }

    /// Expand `id`; returns false if it was not collapsed
    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    /// Flip membership; returns true if `id` is collapsed afterwards
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            false
        } else {
            self.ids.insert(id.to_string());
            true
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: Into<NodeId>> FromIterator<S> for CollapsedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// The currently displayed subgraph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityResult {
    /// Visible nodes, in input order
    pub visible_nodes: Vec<Node>,
    /// Visible edges, in input order
    pub visible_edges: Vec<Edge>,
}

impl VisibilityResult {
    pub fn visible_edge_ids(&self) -> HashSet<EdgeId> {
        self.visible_edges.iter().map(|e| e.id.clone()).collect()
    }

    pub fn visible_node_ids(&self) -> HashSet<NodeId> {
        self.visible_nodes.iter().map(|n| n.id.clone()).collect()
    }
}

/// Arena view of the collapse hierarchy
#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    ids: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
}

impl HierarchyIndex {
    /// Build from a node list plus edges; hierarchy links to unknown ids are skipped
    pub fn from_graph(nodes: &[Node], edges: &[Edge]) -> Self {
        let mut hierarchy = Self::default();
        for node in nodes {
            hierarchy.intern(&node.id);
        }
        for node in nodes {
            if let Some(parent) = &node.parent {
                if let (Some(p), Some(c)) = (hierarchy.get(parent), hierarchy.get(&node.id)) {
                    hierarchy.link(p, c);
                }
            }
        }
        for edge in edges.iter().filter(|e| e.is_hierarchy()) {
            if let (Some(p), Some(c)) = (hierarchy.get(&edge.source), hierarchy.get(&edge.target)) {
                hierarchy.link(p, c);
            }
        }
        hierarchy
    }

    /// Build from edges alone; every endpoint becomes a node
    pub fn from_edges(edges: &[Edge]) -> Self {
        let mut hierarchy = Self::default();
        for edge in edges {
            let p = hierarchy.intern(&edge.source);
            let c = hierarchy.intern(&edge.target);
            if edge.is_hierarchy() {
                hierarchy.link(p, c);
            }
        }
        hierarchy
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        self.index.insert(id.to_string(), idx);
        self.parents.push(Vec::new());
        self.children.push(Vec::new());
        idx
    }

    fn link(&mut self, parent: usize, child: usize) {
        if parent == child || self.parents[child].contains(&parent) {
            return;
        }
        self.parents[child].push(parent);
        self.children[parent].push(child);
    }

    pub fn get(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn parents(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// Mark every collapsed node and every descendant of one as hidden
    pub fn hidden_mask(&self, collapsed: &CollapsedSet) -> Vec<bool> {
        let mut hidden = vec![false; self.len()];
        let mut queue: VecDeque<usize> = collapsed.iter().filter_map(|id| self.get(id)).collect();
        for &idx in &queue {
            hidden[idx] = true;
        }
        while let Some(idx) = queue.pop_front() {
            for &child in &self.children[idx] {
                if !hidden[child] {
                    hidden[child] = true;
                    queue.push_back(child);
                }
            }
        }
        hidden
    }

    /// Ancestors of `target` (and `target` itself) that are not known to be
    /// visible, every node listed after all of its listed ancestors and
    /// `target` last.
    ///
    /// Every ancestor path is followed upward until it reaches a node for which
    /// `is_visible` holds. The order is a depth-first post-order over parents
    /// in insertion order, so it stays topological when ancestor paths share
    /// nodes. Inside a cycle the order is arbitrary.
    pub fn expand_path(&self, target: usize, is_visible: impl Fn(usize) -> bool) -> Vec<usize> {
        if is_visible(target) {
            return Vec::new();
        }
        let mut visited = vec![false; self.len()];
        let mut order = Vec::new();
        // (node, index of the next parent to look at)
        let mut stack = vec![(target, 0usize)];
        visited[target] = true;

        while let Some((idx, next)) = stack.pop() {
            match self.parents[idx].get(next) {
                Some(&parent) => {
                    stack.push((idx, next + 1));
                    if !visited[parent] && !is_visible(parent) {
                        visited[parent] = true;
                        stack.push((parent, 0));
                    }
                }
                None => order.push(idx),
            }
        }

        order
    }
}

/// Reduce `nodes`/`edges` to the subgraph visible under `collapsed`
///
/// Unknown collapsed ids are ignored. With nothing collapsed the inputs come
/// back unchanged.
pub fn get_visible_entities(
    collapsed: &CollapsedSet,
    nodes: &[Node],
    edges: &[Edge],
) -> VisibilityResult {
    if collapsed.is_empty() {
        return VisibilityResult {
            visible_nodes: nodes.to_vec(),
            visible_edges: edges.to_vec(),
        };
    }

    let hierarchy = HierarchyIndex::from_graph(nodes, edges);
    let hidden = hierarchy.hidden_mask(collapsed);
    project_with(&hierarchy, &hidden, nodes, edges)
}

fn project_with(
    hierarchy: &HierarchyIndex,
    hidden: &[bool],
    nodes: &[Node],
    edges: &[Edge],
) -> VisibilityResult {
    let is_visible = |id: &str| hierarchy.get(id).is_some_and(|idx| !hidden[idx]);

    let visible_nodes: Vec<Node> = nodes
        .iter()
        .filter(|n| is_visible(&n.id))
        .cloned()
        .collect();
    let visible_edges: Vec<Edge> = edges
        .iter()
        .filter(|e| is_visible(&e.source) && is_visible(&e.target))
        .cloned()
        .collect();

    debug!(
        nodes = nodes.len(),
        visible_nodes = visible_nodes.len(),
        edges = edges.len(),
        visible_edges = visible_edges.len(),
        "projected visible subgraph"
    );

    VisibilityResult {
        visible_nodes,
        visible_edges,
    }
}

/// Ids to remove from the collapsed set, root first, so that `node_id` appears
///
/// A node is treated as already visible when it is an endpoint of one of
/// `visible_edge_ids`. Returns an empty list when `node_id` is unknown or
/// already visible.
pub fn get_expand_path<I, S>(node_id: &str, edges: &[Edge], visible_edge_ids: I) -> Vec<NodeId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let hierarchy = HierarchyIndex::from_edges(edges);
    let Some(target) = hierarchy.get(node_id) else {
        debug!(node_id, "expand path requested for unknown node");
        return Vec::new();
    };

    let visible_edges: HashSet<String> = visible_edge_ids
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .collect();
    let mut implied_visible = vec![false; hierarchy.len()];
    for edge in edges.iter().filter(|e| visible_edges.contains(&e.id)) {
        for endpoint in [&edge.source, &edge.target] {
            if let Some(idx) = hierarchy.get(endpoint) {
                implied_visible[idx] = true;
            }
        }
    }

    hierarchy
        .expand_path(target, |idx| implied_visible[idx])
        .into_iter()
        .map(|idx| hierarchy.id(idx).to_string())
        .collect()
}

/// Collapse state plus projection for one graph view
#[derive(Debug, Clone, Default)]
pub struct VisibilityProjector {
    collapsed: CollapsedSet,
}

impl VisibilityProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collapsed(collapsed: CollapsedSet) -> Self {
        Self { collapsed }
    }

    pub fn collapsed(&self) -> &CollapsedSet {
        &self.collapsed
    }

    pub fn collapse(&mut self, id: impl Into<NodeId>) -> bool {
        self.collapsed.insert(id)
    }

    pub fn expand(&mut self, id: &str) -> bool {
        self.collapsed.remove(id)
    }

    pub fn toggle(&mut self, id: &str) -> bool {
        self.collapsed.toggle(id)
    }

    pub fn project(&self, nodes: &[Node], edges: &[Edge]) -> VisibilityResult {
        get_visible_entities(&self.collapsed, nodes, edges)
    }

    /// Expand whatever keeps `node_id` hidden and return the expanded path
    ///
    /// Uses node `parent` links as well as hierarchy edges, and the current
    /// projection (rather than edge endpoints) to decide what is visible.
    pub fn reveal(&mut self, node_id: &str, nodes: &[Node], edges: &[Edge]) -> Vec<NodeId> {
        let hierarchy = HierarchyIndex::from_graph(nodes, edges);
        let Some(target) = hierarchy.get(node_id) else {
            return Vec::new();
        };
        let hidden = hierarchy.hidden_mask(&self.collapsed);
        let path: Vec<NodeId> = hierarchy
            .expand_path(target, |idx| !hidden[idx])
            .into_iter()
            .map(|idx| hierarchy.id(idx).to_string())
            .collect();
        for id in &path {
            self.collapsed.remove(id);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id)).collect()
    }

    fn chain() -> (Vec<Node>, Vec<Edge>) {
        (
            nodes(&["A", "B", "C"]),
            vec![Edge::new("ab", "A", "B"), Edge::new("bc", "B", "C")],
        )
    }

    fn ids(nodes: &[Node]) -> String {
        nodes
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Deterministic tree with a few extra links: 0 is the root, i's parent is (i-1)/2
    fn binary_tree(n: usize) -> (Vec<Node>, Vec<Edge>) {
        let nodes: Vec<Node> = (0..n).map(|i| Node::new(format!("n{i}"))).collect();
        let mut edges: Vec<Edge> = (1..n)
            .map(|i| Edge::new(format!("h{i}"), format!("n{}", (i - 1) / 2), format!("n{i}")))
            .collect();
        for i in (3..n).step_by(3) {
            edges.push(Edge::link(format!("l{i}"), format!("n{i}"), "n1"));
        }
        (nodes, edges)
    }

    fn has_collapsed_ancestor(
        hierarchy: &HierarchyIndex,
        collapsed: &CollapsedSet,
        id: &str,
    ) -> bool {
        let mut stack = vec![hierarchy.get(id).unwrap()];
        let mut seen = HashSet::new();
        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                continue;
            }
            if collapsed.contains(hierarchy.id(idx)) {
                return true;
            }
            stack.extend_from_slice(hierarchy.parents(idx));
        }
        false
    }

    #[test]
    fn empty_collapsed_set_returns_input_unchanged() {
        let (nodes, edges) = binary_tree(12);
        let result = get_visible_entities(&CollapsedSet::new(), &nodes, &edges);
        assert_eq!(result.visible_nodes, nodes);
        assert_eq!(result.visible_edges, edges);
    }

    #[test]
    fn collapsing_middle_of_chain_hides_subtree() {
        let (nodes, edges) = chain();
        let collapsed: CollapsedSet = ["B"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);

        assert_snapshot!(ids(&result.visible_nodes), @"A");
        assert!(result.visible_edges.is_empty());
    }

    #[test]
    fn unknown_collapsed_ids_are_ignored() {
        let (nodes, edges) = chain();
        let collapsed: CollapsedSet = ["nope", "also-nope"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);
        assert_eq!(result.visible_nodes, nodes);
        assert_eq!(result.visible_edges, edges);
    }

    #[test]
    fn collapsing_a_leaf_only_hides_that_leaf() {
        let nodes = nodes(&["root", "left", "right"]);
        let edges = vec![
            Edge::new("l", "root", "left"),
            Edge::new("r", "root", "right"),
        ];
        let collapsed: CollapsedSet = ["left"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);

        assert_snapshot!(ids(&result.visible_nodes), @"root,right");
        assert_eq!(result.visible_edges.len(), 1);
        assert_eq!(result.visible_edges[0].id, "r");
    }

    #[test]
    fn visibility_invariants_hold_for_every_single_collapse() {
        let (nodes, edges) = binary_tree(15);
        let hierarchy = HierarchyIndex::from_graph(&nodes, &edges);

        for first in &nodes {
            for second in &nodes {
                let collapsed: CollapsedSet =
                    [first.id.clone(), second.id.clone()].into_iter().collect();
                let result = get_visible_entities(&collapsed, &nodes, &edges);
                let visible = result.visible_node_ids();

                for node in &nodes {
                    assert_eq!(
                        visible.contains(&node.id),
                        !has_collapsed_ancestor(&hierarchy, &collapsed, &node.id),
                        "node {} with collapsed {:?}",
                        node.id,
                        collapsed
                    );
                }
                for edge in &edges {
                    let both = visible.contains(&edge.source) && visible.contains(&edge.target);
                    assert_eq!(result.visible_edge_ids().contains(&edge.id), both);
                }
            }
        }
    }

    #[test]
    fn projection_preserves_input_order() {
        let nodes = nodes(&["z", "a", "m", "b"]);
        let edges = vec![Edge::new("e1", "a", "b")];
        let collapsed: CollapsedSet = ["b"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);
        assert_snapshot!(ids(&result.visible_nodes), @"z,a,m");
    }

    #[test]
    fn cycles_terminate() {
        let nodes = nodes(&["A", "B", "C", "D"]);
        let edges = vec![
            Edge::new("ab", "A", "B"),
            Edge::new("bc", "B", "C"),
            Edge::new("ca", "C", "A"),
            Edge::new("cd", "C", "D"),
        ];
        let collapsed: CollapsedSet = ["B"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);
        assert!(result.visible_nodes.is_empty());

        let path = get_expand_path("D", &edges, Vec::<String>::new());
        assert_eq!(path.len(), 4);
        assert_eq!(path.last().map(String::as_str), Some("D"));
    }

    #[test]
    fn any_collapsed_ancestor_path_hides_node() {
        // shared has two parents; only one of them is collapsed
        let nodes = nodes(&["p1", "p2", "shared"]);
        let edges = vec![
            Edge::new("a", "p1", "shared"),
            Edge::new("b", "p2", "shared"),
        ];
        let collapsed: CollapsedSet = ["p2"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);
        assert_snapshot!(ids(&result.visible_nodes), @"p1");
    }

    #[test]
    fn parent_links_and_link_edges() {
        let nodes = vec![
            Node::new("root"),
            Node::new("child").with_parent("root"),
            Node::new("friend"),
        ];
        // link edges never hide their target
        let edges = vec![Edge::link("x", "root", "friend")];
        let collapsed: CollapsedSet = ["root"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);

        assert_snapshot!(ids(&result.visible_nodes), @"friend");
        assert!(result.visible_edges.is_empty());
    }

    #[test]
    fn expand_path_is_root_first() {
        let (_, edges) = chain();
        // nothing visible: the whole chain must be expanded
        let path = get_expand_path("C", &edges, Vec::<String>::new());
        assert_snapshot!(path.join(","), @"A,B,C");
    }

    #[test]
    fn expand_path_stops_at_visible_ancestor() {
        let nodes = nodes(&["A", "B", "C", "D"]);
        let edges = vec![
            Edge::new("ab", "A", "B"),
            Edge::new("bc", "B", "C"),
            Edge::new("cd", "C", "D"),
        ];
        let collapsed: CollapsedSet = ["C"].into_iter().collect();
        let result = get_visible_entities(&collapsed, &nodes, &edges);

        let path = get_expand_path("D", &edges, result.visible_edge_ids());
        assert_snapshot!(path.join(","), @"C,D");
    }

    #[test]
    fn expand_path_unknown_or_visible_node_is_empty() {
        let (nodes, edges) = chain();
        assert!(get_expand_path("missing", &edges, ["ab"]).is_empty());

        let result = get_visible_entities(&CollapsedSet::new(), &nodes, &edges);
        assert!(get_expand_path("B", &edges, result.visible_edge_ids()).is_empty());
    }

    #[test]
    fn expanding_the_path_reveals_the_node() {
        let (nodes, edges) = binary_tree(15);

        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i) {
                let collapsed: CollapsedSet =
                    [a.id.clone(), b.id.clone()].into_iter().collect();
                let before = get_visible_entities(&collapsed, &nodes, &edges);

                for target in &nodes {
                    if before.visible_node_ids().contains(&target.id) {
                        continue;
                    }
                    let path = get_expand_path(&target.id, &edges, before.visible_edge_ids());
                    let mut expanded = collapsed.clone();
                    for id in &path {
                        expanded.remove(id);
                    }
                    let after = get_visible_entities(&expanded, &nodes, &edges);
                    assert!(
                        after.visible_node_ids().contains(&target.id),
                        "{} still hidden after expanding {:?} from {:?}",
                        target.id,
                        path,
                        collapsed
                    );
                }
            }
        }
    }

    #[test]
    fn expand_path_covers_every_hidden_parent() {
        let edges = vec![
            Edge::new("a", "p1", "shared"),
            Edge::new("b", "p2", "shared"),
            Edge::new("c", "root", "p2"),
        ];
        let path = get_expand_path("shared", &edges, Vec::<String>::new());
        assert_snapshot!(path.join(","), @"p1,root,p2,shared");
    }

    #[test]
    fn expand_path_lists_shared_ancestor_before_its_child() {
        let edges = vec![
            Edge::new("a", "P1", "T"),
            Edge::new("b", "P2", "T"),
            Edge::new("c", "P1", "P2"),
        ];
        let path = get_expand_path("T", &edges, Vec::<String>::new());
        assert_snapshot!(path.join(","), @"P1,P2,T");
    }

    #[test]
    fn expand_path_is_topological_in_a_layered_dag() {
        // every node in layer k is a child of every node in layer k - 1
        let layers = [vec!["r"], vec!["a", "b"], vec!["c", "d", "e"], vec!["t"]];
        let mut edges = Vec::new();
        for pair in layers.windows(2) {
            for parent in &pair[0] {
                for child in &pair[1] {
                    edges.push(Edge::new(format!("{parent}{child}"), *parent, *child));
                }
            }
        }
        // shortcuts that skip a layer
        edges.push(Edge::new("r-t", "r", "t"));
        edges.push(Edge::new("a-t", "a", "t"));

        let path = get_expand_path("t", &edges, Vec::<String>::new());
        assert_eq!(path.len(), 7);
        assert_eq!(path.last().map(String::as_str), Some("t"));

        let position: HashMap<&str, usize> =
            path.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for edge in &edges {
            assert!(
                position[edge.source.as_str()] < position[edge.target.as_str()],
                "{} listed after its child {} in {path:?}",
                edge.source,
                edge.target
            );
        }
    }

    #[test]
    fn collapsed_set_is_idempotent() {
        let mut set = CollapsedSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert_eq!(set.len(), 1);

        assert!(!set.toggle("a"));
        assert!(set.is_empty());
        assert!(set.toggle("a"));
        assert!(set.contains("a"));
    }

    #[test]
    fn projector_reveal_expands_hidden_ancestors() {
        let (nodes, edges) = chain();
        let mut projector = VisibilityProjector::new();
        projector.collapse("A");
        projector.collapse("B");
        assert!(projector.project(&nodes, &edges).visible_nodes.is_empty());

        let path = projector.reveal("C", &nodes, &edges);
        assert_snapshot!(path.join(","), @"A,B,C");
        assert!(projector.collapsed().is_empty());
        assert_eq!(projector.project(&nodes, &edges).visible_nodes.len(), 3);

        assert!(projector.reveal("C", &nodes, &edges).is_empty());
    }
}
