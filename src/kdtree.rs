//! Const-generic KD-tree over `f64` points.
//!
//! Used in three dimensions for star positions on the unit sphere, four for
//! quad codes, and two for projected pixel positions during verification.

/// A point found by a search: caller-supplied id and squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub index: usize,
    pub dist_sq: f64,
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        dim: usize,
        value: f64,
        left: usize,
        right: usize,
    },
    /// `[start, end)` into the reordered point arrays.
    Leaf { start: usize, end: usize },
}

const LEAF_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct KdTree<const DIM: usize> {
    nodes: Vec<Node>,
    points: Vec<[f64; DIM]>,
    ids: Vec<usize>,
}

impl<const DIM: usize> Default for KdTree<DIM> {
    fn default() -> Self {
        KdTree {
            nodes: Vec::new(),
            points: Vec::new(),
            ids: Vec::new(),
        }
    }
}

impl<const DIM: usize> KdTree<DIM> {
    /// Build from points paired with ids. Only the shorter length of the two
    /// inputs is used.
    pub fn build(points: Vec<[f64; DIM]>, ids: Vec<usize>) -> Self {
        let mut entries: Vec<([f64; DIM], usize)> = points.into_iter().zip(ids).collect();
        let mut nodes = Vec::new();
        if !entries.is_empty() {
            let len = entries.len();
            split(&mut entries, 0, len, &mut nodes);
        }
        let (points, ids) = entries.into_iter().unzip();
        KdTree { nodes, points, ids }
    }

    /// Build over `points`, using each point's position as its id.
    pub fn from_points(points: Vec<[f64; DIM]>) -> Self {
        let ids = (0..points.len()).collect();
        Self::build(points, ids)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Every point within squared distance `radius_sq` of `query`, in tree order.
    pub fn range_search(&self, query: &[f64; DIM], radius_sq: f64) -> Vec<SearchResult> {
        let mut found = Vec::new();
        if !self.nodes.is_empty() {
            self.collect_within(0, query, radius_sq, &mut found);
        }
        found
    }

    pub fn nearest(&self, query: &[f64; DIM]) -> Option<SearchResult> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut best = SearchResult {
            index: usize::MAX,
            dist_sq: f64::INFINITY,
        };
        self.descend_nearest(0, query, &mut best);
        (best.index != usize::MAX).then_some(best)
    }

    fn collect_within(
        &self,
        node: usize,
        query: &[f64; DIM],
        radius_sq: f64,
        found: &mut Vec<SearchResult>,
    ) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                found.extend((start..end).filter_map(|i| {
                    let dist_sq = squared_distance(query, &self.points[i]);
                    (dist_sq <= radius_sq).then_some(SearchResult {
                        index: self.ids[i],
                        dist_sq,
                    })
                }));
            }
            Node::Split {
                dim,
                value,
                left,
                right,
            } => {
                let offset = query[dim] - value;
                let (near, far) = if offset <= 0.0 { (left, right) } else { (right, left) };
                self.collect_within(near, query, radius_sq, found);
                if offset * offset <= radius_sq {
                    self.collect_within(far, query, radius_sq, found);
                }
            }
        }
    }

    fn descend_nearest(&self, node: usize, query: &[f64; DIM], best: &mut SearchResult) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for i in start..end {
                    let dist_sq = squared_distance(query, &self.points[i]);
                    if dist_sq < best.dist_sq {
                        *best = SearchResult {
                            index: self.ids[i],
                            dist_sq,
                        };
                    }
                }
            }
            Node::Split {
                dim,
                value,
                left,
                right,
            } => {
                let offset = query[dim] - value;
                let (near, far) = if offset <= 0.0 { (left, right) } else { (right, left) };
                self.descend_nearest(near, query, best);
                if offset * offset < best.dist_sq {
                    self.descend_nearest(far, query, best);
                }
            }
        }
    }
}

/// Recursively partition `entries[start..end]`, returning the new node's slot.
fn split<const DIM: usize>(
    entries: &mut [([f64; DIM], usize)],
    start: usize,
    end: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let slot = nodes.len();
    if end - start <= LEAF_SIZE {
        nodes.push(Node::Leaf { start, end });
        return slot;
    }

    let dim = widest_dimension(&entries[start..end]);
    let mid = (end - start) / 2;
    entries[start..end].select_nth_unstable_by(mid, |a, b| a.0[dim].total_cmp(&b.0[dim]));
    let value = entries[start + mid].0[dim];

    nodes.push(Node::Leaf { start: 0, end: 0 });
    let left = split(entries, start, start + mid, nodes);
    let right = split(entries, start + mid, end, nodes);
    nodes[slot] = Node::Split {
        dim,
        value,
        left,
        right,
    };
    slot
}

fn widest_dimension<const DIM: usize>(entries: &[([f64; DIM], usize)]) -> usize {
    (0..DIM)
        .map(|d| {
            let (lo, hi) = entries.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), e| {
                (lo.min(e.0[d]), hi.max(e.0[d]))
            });
            (d, hi - lo)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(d, _)| d)
}

#[inline]
fn squared_distance<const DIM: usize>(a: &[f64; DIM], b: &[f64; DIM]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scatter<const DIM: usize>(n: usize, seed: u64) -> Vec<[f64; DIM]> {
        let mut state = seed;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as f64 / u64::MAX as f64
        };
        (0..n).map(|_| std::array::from_fn(|_| next())).collect()
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let tree = KdTree::<3>::default();
        assert!(tree.is_empty());
        assert!(tree.nearest(&[0.0; 3]).is_none());
        assert!(tree.range_search(&[0.0; 3], 10.0).is_empty());
    }

    #[test]
    fn range_search_agrees_with_brute_force() {
        let points = scatter::<3>(500, 42);
        let tree = KdTree::from_points(points.clone());
        assert_eq!(tree.len(), 500);
        for query in scatter::<3>(20, 7) {
            let mut got: Vec<usize> = tree.range_search(&query, 0.04).iter().map(|r| r.index).collect();
            got.sort_unstable();
            let expected: Vec<usize> = (0..points.len())
                .filter(|&i| squared_distance(&query, &points[i]) <= 0.04)
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn nearest_agrees_with_brute_force() {
        let points = scatter::<4>(300, 99);
        let tree = KdTree::from_points(points.clone());
        for query in scatter::<4>(20, 3) {
            let got = tree.nearest(&query).unwrap();
            let best = (0..points.len())
                .min_by(|&a, &b| {
                    squared_distance(&query, &points[a]).total_cmp(&squared_distance(&query, &points[b]))
                })
                .unwrap();
            assert_eq!(got.index, best);
        }
    }

    #[test]
    fn ids_survive_reordering() {
        let points = vec![[3.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        let tree = KdTree::build(points, vec![30, 10, 20]);
        assert_eq!(tree.nearest(&[1.1, 0.0]).unwrap().index, 10);
        assert_eq!(tree.nearest(&[2.9, 0.0]).unwrap().index, 30);
    }

    #[test]
    fn coincident_points_are_all_reported() {
        let tree = KdTree::from_points(vec![[0.5, 0.5]; 40]);
        assert_eq!(tree.range_search(&[0.5, 0.5], 0.0).len(), 40);
    }
}
