use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::GraphError;

/// Requirements on a node identifier.
pub trait NodeId: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> NodeId for T {}

/// One row of a declarative graph table.
#[derive(Debug, Clone)]
pub struct NodeDecl<N, A> {
    pub id: N,
    pub action: Option<A>,
    pub children: Vec<N>,
}

impl<N: NodeId, A> NodeDecl<N, A> {
    /// A state node: no handler, children are its valid exits.
    pub fn state(id: N, children: impl Into<Vec<N>>) -> Self {
        Self {
            id,
            action: None,
            children: children.into(),
        }
    }

    pub fn action(id: N, action: A, children: impl Into<Vec<N>>) -> Self {
        Self {
            id,
            action: Some(action),
            children: children.into(),
        }
    }
}

impl<N: NodeId> NodeDecl<N, N> {
    /// An action node whose handler is keyed by the node id itself.
    pub fn handler(id: N, children: impl Into<Vec<N>>) -> Self {
        Self::action(id, id, children)
    }
}

#[derive(Debug)]
pub struct Node<N, A> {
    pub id: N,
    pub action: Option<A>,
    children: Vec<usize>,
}

impl<N, A> Node<N, A> {
    pub fn is_state(&self) -> bool {
        self.action.is_none()
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// Immutable directed graph of state and action nodes.
#[derive(Debug)]
pub struct Graph<N, A> {
    nodes: Vec<Node<N, A>>,
    index: HashMap<N, usize>,
    root: usize,
}

impl<N: NodeId, A> Graph<N, A> {
    pub fn build(root: N, decls: Vec<NodeDecl<N, A>>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            if index.insert(decl.id, i).is_some() {
                return Err(GraphError::DuplicateNode {
                    node: format!("{:?}", decl.id),
                });
            }
        }

        let root = *index.get(&root).ok_or_else(|| GraphError::UnknownRoot {
            root: format!("{:?}", root),
        })?;

        let mut nodes = Vec::with_capacity(decls.len());
        for decl in decls {
            let mut children = Vec::with_capacity(decl.children.len());
            for child in &decl.children {
                let idx = index.get(child).ok_or_else(|| GraphError::UnknownChild {
                    node: format!("{:?}", decl.id),
                    child: format!("{:?}", child),
                })?;
                children.push(*idx);
            }
            nodes.push(Node {
                id: decl.id,
                action: decl.action,
                children,
            });
        }

        Ok(Self { nodes, index, root })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node<N, A> {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: N) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Shortest path from `from` to the node `to`, both ends included.
    ///
    /// Depth-first over children in declaration order. Nodes already on the
    /// current path are never revisited, and once a path is known only
    /// strictly shorter candidates are explored. The first path of minimal
    /// length that the search discovers wins. When `from` already is `to`
    /// the path is just `[from]`.
    pub fn find_path(&self, from: usize, to: N) -> Option<Vec<usize>> {
        if self.nodes[from].id == to {
            return Some(vec![from]);
        }

        let mut clip = self.nodes.len();
        let mut best = None;
        let mut path = Vec::with_capacity(self.nodes.len());
        self.search(&mut path, from, to, &mut clip, &mut best);
        best
    }

    fn search(
        &self,
        path: &mut Vec<usize>,
        node: usize,
        to: N,
        clip: &mut usize,
        best: &mut Option<Vec<usize>>,
    ) {
        path.push(node);
        if path.len() >= *clip {
            path.pop();
            return;
        }

        for &child in &self.nodes[node].children {
            if path.contains(&child) {
                continue;
            }
            if self.nodes[child].id == to {
                // Siblings cannot produce anything shorter than this.
                *clip = path.len();
                let mut found = path.clone();
                found.push(child);
                *best = Some(found);
                path.pop();
                return;
            }
            self.search(path, child, to, clip, best);
        }

        path.pop();
    }

    /// Number of action nodes in a path.
    pub fn count_actions(&self, path: impl IntoIterator<Item = usize>) -> usize {
        path.into_iter()
            .filter(|idx| !self.nodes[*idx].is_state())
            .count()
    }

    pub fn ids(&self, path: &[usize]) -> Vec<N> {
        path.iter().map(|idx| self.nodes[*idx].id).collect()
    }
}
