use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;

use crate::errors::{KmerError, Result};

/// Opaque taxon identifier, e.g. an NCBI taxid.
pub type TaxId = String;
/// Dense node handle inside one taxonomy.
pub type TaxNode = u32;

/// Read-only ancestor queries the matcher needs from a taxonomy.
pub trait TaxonomyOracle: Send + Sync {
    fn node_of(&self, id: &str) -> Option<TaxNode>;

    fn id_of(&self, node: TaxNode) -> &str;

    /// True if `candidate_ancestor` is `node` or lies on its path to the root.
    fn is_ancestor_of(&self, node: TaxNode, candidate_ancestor: TaxNode) -> bool;

    /// `None` when the nodes live in disconnected trees.
    fn lowest_common_ancestor(&self, a: TaxNode, b: TaxNode) -> Option<TaxNode>;

    fn lca_of_ids(&self, a: &str, b: &str) -> Option<TaxId> {
        let a = self.node_of(a)?;
        let b = self.node_of(b)?;
        self.lowest_common_ancestor(a, b)
            .map(|node| self.id_of(node).to_string())
    }

    fn is_ancestor_of_id(&self, node: &str, candidate_ancestor: &str) -> bool {
        match (self.node_of(node), self.node_of(candidate_ancestor)) {
            (Some(n), Some(a)) => self.is_ancestor_of(n, a),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct TaxonomyNode {
    id: TaxId,
    parent: TaxNode,
    depth: u32,
}

/// In-memory taxonomy tree built from `child -> parent` edges.
///
/// A node whose parent is itself, `0`, or empty is a root. Several roots are
/// allowed; nodes in different trees have no common ancestor.
#[derive(Debug, Clone, Default)]
pub struct TaxTree {
    nodes: Vec<TaxonomyNode>,
    external_to_internal_id_map: HashMap<TaxId, TaxNode>,
}

impl TaxTree {
    pub fn from_edges<'a, I>(edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tree = TaxTree::default();
        let mut parents: Vec<Option<TaxId>> = Vec::new();
        for (child, parent) in edges {
            if child.is_empty() || child == "0" {
                return Err(KmerError::InvalidConfig(format!(
                    "invalid taxonomy node id '{}'",
                    child
                )));
            }
            let node = tree.intern(child);
            if parents.len() <= node as usize {
                parents.resize(node as usize + 1, None);
            }
            let is_root = parent.is_empty() || parent == "0" || parent == child;
            parents[node as usize] = if is_root {
                None
            } else {
                Some(parent.to_string())
            };
        }
        parents.resize(tree.nodes.len(), None);

        for (node, parent) in parents.iter().enumerate() {
            if let Some(parent) = parent {
                let parent_node = tree.external_to_internal_id_map.get(parent).copied();
                match parent_node {
                    Some(p) => tree.nodes[node].parent = p,
                    None => {
                        return Err(KmerError::InvalidConfig(format!(
                            "parent '{}' of '{}' not found",
                            parent, tree.nodes[node].id
                        )))
                    }
                }
            }
        }
        tree.compute_depths()?;
        Ok(tree)
    }

    /// Parses `child<TAB>parent` lines or NCBI `nodes.dmp` lines
    /// (`child\t|\tparent\t|\t...`). Blank lines and `#` comments are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut edges: Vec<(String, String)> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = if line.contains("\t|\t") {
                line.split("\t|\t").collect()
            } else {
                line.split('\t').collect()
            };
            if fields.len() < 2 {
                return Err(KmerError::InvalidConfig(format!(
                    "malformed taxonomy line '{}'",
                    line
                )));
            }
            edges.push((fields[0].trim().to_string(), fields[1].trim().to_string()));
        }
        Self::from_edges(edges.iter().map(|(c, p)| (c.as_str(), p.as_str())))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tree = Self::from_reader(BufReader::new(File::open(path.as_ref())?))?;
        info!(
            "loaded taxonomy with {} nodes from {}",
            tree.len(),
            path.as_ref().display()
        );
        Ok(tree)
    }

    fn intern(&mut self, id: &str) -> TaxNode {
        if let Some(&node) = self.external_to_internal_id_map.get(id) {
            return node;
        }
        let node = self.nodes.len() as TaxNode;
        self.nodes.push(TaxonomyNode {
            id: id.to_string(),
            parent: node,
            depth: 0,
        });
        self.external_to_internal_id_map.insert(id.to_string(), node);
        node
    }

    fn compute_depths(&mut self) -> Result<()> {
        const UNKNOWN: u32 = u32::MAX;
        let mut depths = vec![UNKNOWN; self.nodes.len()];
        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            let mut current = start;
            while depths[current] == UNKNOWN {
                if path.len() > self.nodes.len() {
                    return Err(KmerError::InvalidConfig(format!(
                        "cycle in taxonomy at '{}'",
                        self.nodes[start].id
                    )));
                }
                path.push(current);
                let parent = self.nodes[current].parent as usize;
                if parent == current {
                    depths[current] = 0;
                    path.pop();
                    break;
                }
                current = parent;
            }
            while let Some(node) = path.pop() {
                let parent = self.nodes[node].parent as usize;
                depths[node] = depths[parent] + 1;
            }
        }
        for (node, depth) in self.nodes.iter_mut().zip(depths) {
            node.depth = depth;
        }
        Ok(())
    }

    pub fn parent_of(&self, node: TaxNode) -> Option<TaxNode> {
        let parent = self.nodes[node as usize].parent;
        (parent != node).then_some(parent)
    }

    pub fn depth(&self, node: TaxNode) -> u32 {
        self.nodes[node as usize].depth
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl TaxonomyOracle for TaxTree {
    fn node_of(&self, id: &str) -> Option<TaxNode> {
        self.external_to_internal_id_map.get(id).copied()
    }

    fn id_of(&self, node: TaxNode) -> &str {
        &self.nodes[node as usize].id
    }

    fn is_ancestor_of(&self, node: TaxNode, candidate_ancestor: TaxNode) -> bool {
        let target_depth = self.depth(candidate_ancestor);
        let mut current = node;
        while self.depth(current) > target_depth {
            current = self.nodes[current as usize].parent;
        }
        current == candidate_ancestor
    }

    fn lowest_common_ancestor(&self, a: TaxNode, b: TaxNode) -> Option<TaxNode> {
        let mut current_a = a;
        let mut current_b = b;
        while self.depth(current_a) > self.depth(current_b) {
            current_a = self.nodes[current_a as usize].parent;
        }
        while self.depth(current_b) > self.depth(current_a) {
            current_b = self.nodes[current_b as usize].parent;
        }
        while current_a != current_b {
            let parent_a = self.nodes[current_a as usize].parent;
            let parent_b = self.nodes[current_b as usize].parent;
            if parent_a == current_a {
                // both are roots of different trees
                return None;
            }
            current_a = parent_a;
            current_b = parent_b;
        }
        Some(current_a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const NODES_DATA: &str =
        "1\t|\t1\t|\tno rank\t|\t\t|\t8\t|\t0\t|\t1\t|\t0\t|\t0\t|\t0\t|\t0\t|\t0\t|\t\t|
2\t|\t1\t|\tsuperkingdom\t|\t\t|\t0\t|\t0\t|\t11\t|\t0\t|\t0\t|\t0\t|\t0\t|\t0\t|\t\t|
3\t|\t1\t|\tclade\t|\t\t|\t8\t|\t0\t|\t1\t|\t0\t|\t0\t|\t0\t|\t0\t|\t0\t|\t\t|";

    fn sample_tree() -> TaxTree {
        //       1
        //      / \
        //     2   3
        //    /     \
        //   4       5
        //            \
        //             6
        TaxTree::from_edges([
            ("1", "1"),
            ("2", "1"),
            ("3", "1"),
            ("4", "2"),
            ("5", "3"),
            ("6", "5"),
        ])
        .unwrap()
    }

    fn node(tree: &TaxTree, id: &str) -> TaxNode {
        tree.node_of(id).unwrap()
    }

    #[test]
    fn test_nodes_dmp_format() {
        let tree = TaxTree::from_reader(Cursor::new(NODES_DATA)).unwrap();
        assert_eq!(tree.len(), 3);
        let root = node(&tree, "1");
        let bacteria = node(&tree, "2");
        let at_rich = node(&tree, "3");
        assert_eq!(tree.parent_of(root), None);
        assert_eq!(tree.parent_of(bacteria), Some(root));
        assert!(tree.is_ancestor_of(bacteria, root));
        assert!(tree.is_ancestor_of(at_rich, root));
        assert!(!tree.is_ancestor_of(root, bacteria));
        assert!(!tree.is_ancestor_of(at_rich, bacteria));
    }

    #[test]
    fn test_tab_format_and_comments() {
        let data = "# child\tparent\n10\t0\n11\t10\n\n12\t11\n";
        let tree = TaxTree::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.depth(node(&tree, "12")), 2);
    }

    #[test]
    fn test_forward_references() {
        let tree = TaxTree::from_edges([("4", "2"), ("2", "1"), ("1", "0")]).unwrap();
        assert_eq!(tree.depth(node(&tree, "4")), 2);
        assert_eq!(tree.lca_of_ids("4", "2").as_deref(), Some("2"));
    }

    #[test]
    fn test_lowest_common_ancestor() {
        let tree = sample_tree();
        assert_eq!(tree.lca_of_ids("4", "6").as_deref(), Some("1"));
        assert_eq!(tree.lca_of_ids("5", "6").as_deref(), Some("5"));
        assert_eq!(tree.lca_of_ids("6", "3").as_deref(), Some("3"));
        assert_eq!(tree.lca_of_ids("2", "2").as_deref(), Some("2"));
        assert_eq!(tree.lca_of_ids("2", "99"), None);
    }

    #[test]
    fn test_is_ancestor() {
        let tree = sample_tree();
        assert!(tree.is_ancestor_of_id("6", "3"));
        assert!(tree.is_ancestor_of_id("6", "6"));
        assert!(tree.is_ancestor_of_id("4", "1"));
        assert!(!tree.is_ancestor_of_id("4", "3"));
        assert!(!tree.is_ancestor_of_id("3", "6"));
    }

    #[test]
    fn test_disconnected_trees() {
        let tree = TaxTree::from_edges([("a", "a"), ("b", "a"), ("x", "x"), ("y", "x")]).unwrap();
        assert_eq!(tree.lca_of_ids("b", "y"), None);
        assert!(!tree.is_ancestor_of_id("y", "a"));
    }

    #[test]
    fn test_invalid_taxonomies() {
        assert!(TaxTree::from_edges([("2", "7")]).is_err());
        assert!(TaxTree::from_edges([("0", "1")]).is_err());
        assert!(TaxTree::from_edges([("1", "2"), ("2", "1")]).is_err());
        assert!(TaxTree::from_reader(Cursor::new("justone\n")).is_err());
    }
}
