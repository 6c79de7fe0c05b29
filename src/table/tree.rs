//! Space-Partitioning Tree
//!
//! A binary tree over a contiguous row range, stored as a node arena. Nodes
//! carry origin-table coordinates (`begin`, `count`), a tight bound, and
//! child links. Splits are always at the row midpoint; combined with the
//! one-time spatial sort performed at shard construction this reproduces the
//! same subtree geometry on every rank that rebuilds a copy from rows.

use super::types::BoundingBox;

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub begin: usize,
    pub count: usize,
    pub bound: BoundingBox,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    pub fn end(&self) -> usize {
        self.begin + self.count
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

pub const ROOT: usize = 0;

impl Tree {
    /// Builds the tree over `rows` without reordering them. `begin_offset`
    /// is the origin-table coordinate of the first row, so imported copies
    /// keep origin numbering.
    pub fn build(rows: &[f64], dim: usize, begin_offset: usize, leaf_size: usize) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let count = rows.len() / dim;
        if count > 0 {
            tree.build_node(rows, dim, begin_offset, begin_offset, count, leaf_size.max(1));
        }
        tree
    }

    fn build_node(
        &mut self,
        rows: &[f64],
        dim: usize,
        begin_offset: usize,
        begin: usize,
        count: usize,
        leaf_size: usize,
    ) -> usize {
        let local = (begin - begin_offset) * dim;
        let bound = BoundingBox::from_rows(&rows[local..local + count * dim], dim);
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            begin,
            count,
            bound,
            left: None,
            right: None,
        });
        if count > leaf_size {
            let half = count / 2;
            let left = self.build_node(rows, dim, begin_offset, begin, half, leaf_size);
            let right =
                self.build_node(rows, dim, begin_offset, begin + half, count - half, leaf_size);
            self.nodes[index].left = Some(left);
            self.nodes[index].right = Some(right);
        }
        index
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Expands the root into a frontier of at most `max_nodes` subtrees,
    /// always splitting the largest expandable node first. Used to carve the
    /// local query tree into roughly `4 * num_threads` work queues.
    pub fn frontier_bounded_by(&self, max_nodes: usize) -> Vec<usize> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut frontier = vec![ROOT];
        while frontier.len() < max_nodes {
            let mut widest: Option<usize> = None;
            for (position, &node_index) in frontier.iter().enumerate() {
                let node = self.node(node_index);
                if node.is_leaf() {
                    continue;
                }
                match widest {
                    Some(best) if self.node(frontier[best]).count >= node.count => {}
                    _ => widest = Some(position),
                }
            }
            let Some(position) = widest else {
                break;
            };
            let node = self.node(frontier[position]);
            let (left, right) = (node.left.unwrap(), node.right.unwrap());
            frontier[position] = left;
            frontier.insert(position + 1, right);
        }
        frontier
    }

    /// Descends to subtrees of at most `max_size` points. These are the
    /// granules the exchange routes between ranks.
    pub fn frontier_bounded_by_size(&self, max_size: usize) -> Vec<usize> {
        let mut frontier = Vec::new();
        if !self.is_empty() {
            self.collect_bounded(ROOT, max_size.max(1), &mut frontier);
        }
        frontier
    }

    fn collect_bounded(&self, index: usize, max_size: usize, out: &mut Vec<usize>) {
        let node = self.node(index);
        if node.count <= max_size || node.is_leaf() {
            out.push(index);
        } else {
            self.collect_bounded(node.left.unwrap(), max_size, out);
            self.collect_bounded(node.right.unwrap(), max_size, out);
        }
    }

    /// Locates the node with exactly the given row range, descending into
    /// whichever child covers it. Returns `None` if no node matches.
    pub fn find_by_begin_count(&self, begin: usize, count: usize) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let mut index = ROOT;
        loop {
            let node = self.node(index);
            if node.begin == begin && node.count == count {
                return Some(index);
            }
            if node.is_leaf() {
                return None;
            }
            let left = self.node(node.left.unwrap());
            index = if begin < left.end() {
                if begin + count > left.end() {
                    return None;
                }
                node.left.unwrap()
            } else {
                node.right.unwrap()
            };
        }
    }
}

/// Recursively sorts rows so that midpoint splits produce spatially tight
/// halves. Runs once, at shard construction; row order is frozen afterwards
/// because subtree identity is positional.
pub fn spatial_sort(rows: &mut [f64], dim: usize, leaf_size: usize) {
    let leaf_size = leaf_size.max(1);
    let count = rows.len() / dim;
    if count <= leaf_size {
        return;
    }
    let bound = BoundingBox::from_rows(rows, dim);
    let split_dim = bound.widest_dim();

    let mut indexed: Vec<Vec<f64>> = rows.chunks_exact(dim).map(|row| row.to_vec()).collect();
    indexed.sort_by(|a, b| a[split_dim].total_cmp(&b[split_dim]));
    for (i, row) in indexed.iter().enumerate() {
        rows[i * dim..(i + 1) * dim].copy_from_slice(row);
    }

    let half = count / 2;
    let (left, right) = rows.split_at_mut(half * dim);
    spatial_sort(left, dim, leaf_size);
    spatial_sort(right, dim, leaf_size);
}
