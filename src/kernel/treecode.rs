//! Barycentric Lagrange treecode for the Stokes kernels.
//!
//! Sources are sorted into an octree. Every cluster with more sources than proxy
//! points carries a tensor Chebyshev grid on its bounding box, and the source
//! strengths are interpolated onto that grid. A target sees a cluster through its
//! proxies when the cluster radius is below `theta` times the distance to the
//! cluster centre, and through its sources otherwise.
use crate::kernel::helpers::{
    add_double_layer_tensor, add_stokeslet, oseen_factor, separation, stresslet_factor,
    Regularization,
};
use crate::kernel::{check_dimensions, check_result};
use crate::params::{KernelOptions, TreecodeOptions};
use crate::traits::StokesEvaluator;
use crate::types::EvalType;
use log::debug;
use num::traits::FloatConst;
use rayon::prelude::*;
use std::cell::RefCell;

/// Kind of source stored in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    /// Point forces, 3 values per source.
    Stokeslet,
    /// Double layer tensors `q n^T`, 9 values per source.
    Stresslet,
}

impl SourceKind {
    fn strength_dim(&self) -> usize {
        match self {
            SourceKind::Stokeslet => 3,
            SourceKind::Stresslet => 9,
        }
    }
}

#[derive(Debug, Clone)]
struct Cluster {
    begin: usize,
    end: usize,
    lower: [f64; 3],
    upper: [f64; 3],
    center: [f64; 3],
    radius: f64,
    children: Vec<usize>,
    proxy_points: Vec<f64>,
    proxy_strengths: Vec<f64>,
}

impl Cluster {
    fn new(begin: usize, end: usize, lower: [f64; 3], upper: [f64; 3]) -> Self {
        let center = [
            0.5 * (lower[0] + upper[0]),
            0.5 * (lower[1] + upper[1]),
            0.5 * (lower[2] + upper[2]),
        ];
        let radius = 0.5
            * ((upper[0] - lower[0]).powi(2)
                + (upper[1] - lower[1]).powi(2)
                + (upper[2] - lower[2]).powi(2))
            .sqrt();
        Self {
            begin,
            end,
            lower,
            upper,
            center,
            radius,
            children: Vec::new(),
            proxy_points: Vec::new(),
            proxy_strengths: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.end - self.begin
    }

    fn has_proxies(&self) -> bool {
        !self.proxy_points.is_empty()
    }
}

/// Sorted sources and their cluster hierarchy.
#[derive(Debug)]
struct SourceTree {
    kind: SourceKind,
    points: Vec<f64>,
    strengths: Vec<f64>,
    clusters: Vec<Cluster>,
}

/// Chebyshev points of the second kind and their barycentric weights.
fn chebyshev_nodes(degree: usize) -> (Vec<f64>, Vec<f64>) {
    let nodes = (0..=degree)
        .map(|k| (f64::PI() * k as f64 / degree as f64).cos())
        .collect();
    let weights = (0..=degree)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            if k == 0 || k == degree {
                0.5 * sign
            } else {
                sign
            }
        })
        .collect();
    (nodes, weights)
}

/// Lagrange basis functions on `nodes` evaluated at `t`.
fn lagrange_basis(t: f64, nodes: &[f64], weights: &[f64], out: &mut [f64]) {
    if let Some(k) = nodes.iter().position(|s| *s == t) {
        out.fill(0.0);
        out[k] = 1.0;
        return;
    }
    let mut denominator = 0.0;
    for ((o, s), w) in out.iter_mut().zip(nodes).zip(weights) {
        *o = w / (t - s);
        denominator += *o;
    }
    for o in out.iter_mut() {
        *o /= denominator;
    }
}

fn bounding_box(points: &[f64], indices: &[usize]) -> ([f64; 3], [f64; 3]) {
    let mut lower = [f64::INFINITY; 3];
    let mut upper = [f64::NEG_INFINITY; 3];
    for i in indices {
        for c in 0..3 {
            lower[c] = lower[c].min(points[3 * i + c]);
            upper[c] = upper[c].max(points[3 * i + c]);
        }
    }
    (lower, upper)
}

impl SourceTree {
    fn new(kind: SourceKind, points: &[f64], strengths: &[f64], options: &TreecodeOptions) -> Self {
        let n = points.len() / 3;
        let dim = kind.strength_dim();
        let mut order: Vec<usize> = (0..n).collect();
        let mut clusters = Vec::new();

        if n > 0 {
            let (lower, upper) = bounding_box(points, &order);
            clusters.push(Cluster::new(0, n, lower, upper));
        }

        let mut stack = if n > 0 { vec![0] } else { vec![] };
        while let Some(index) = stack.pop() {
            let (begin, end, center, radius) = {
                let c = &clusters[index];
                (c.begin, c.end, c.center, c.radius)
            };
            if end - begin <= options.max_leaf_size() || radius == 0.0 {
                continue;
            }

            let octant = |i: usize| {
                (0..3).fold(0, |key, c| {
                    key | (usize::from(points[3 * i + c] > center[c]) << c)
                })
            };
            order[begin..end].sort_by_key(|i| octant(*i));

            let mut ranges = Vec::new();
            let mut start = begin;
            while start < end {
                let key = octant(order[start]);
                let mut stop = start + 1;
                while stop < end && octant(order[stop]) == key {
                    stop += 1;
                }
                ranges.push(start..stop);
                start = stop;
            }
            // The midpoint can round onto a face of a box only a few ulps wide, putting
            // every source into one octant. Such a cluster stays a leaf.
            if ranges.len() < 2 {
                continue;
            }

            let mut children = Vec::with_capacity(ranges.len());
            for range in ranges {
                let (lower, upper) = bounding_box(points, &order[range.clone()]);
                children.push(clusters.len());
                stack.push(clusters.len());
                clusters.push(Cluster::new(range.start, range.end, lower, upper));
            }
            clusters[index].children = children;
        }

        let mut sorted_points = Vec::with_capacity(3 * n);
        let mut sorted_strengths = Vec::with_capacity(dim * n);
        for i in &order {
            sorted_points.extend_from_slice(&points[3 * i..3 * i + 3]);
            sorted_strengths.extend_from_slice(&strengths[dim * i..dim * (i + 1)]);
        }

        let mut tree = Self {
            kind,
            points: sorted_points,
            strengths: sorted_strengths,
            clusters,
        };
        tree.compute_proxies(options);
        tree
    }

    fn compute_proxies(&mut self, options: &TreecodeOptions) {
        let degree = options.degree();
        let proxy_count = options.proxy_count();
        let dim = self.kind.strength_dim();
        let (nodes, weights) = chebyshev_nodes(degree);
        let points = &self.points;
        let strengths = &self.strengths;

        self.clusters
            .par_iter_mut()
            .filter(|cluster| cluster.len() > proxy_count)
            .for_each(|cluster| {
                let half = [
                    0.5 * (cluster.upper[0] - cluster.lower[0]),
                    0.5 * (cluster.upper[1] - cluster.lower[1]),
                    0.5 * (cluster.upper[2] - cluster.lower[2]),
                ];

                let mut proxy_points = Vec::with_capacity(3 * proxy_count);
                for a in 0..=degree {
                    for b in 0..=degree {
                        for c in 0..=degree {
                            proxy_points.push(cluster.center[0] + half[0] * nodes[a]);
                            proxy_points.push(cluster.center[1] + half[1] * nodes[b]);
                            proxy_points.push(cluster.center[2] + half[2] * nodes[c]);
                        }
                    }
                }

                let mut proxy_strengths = vec![0.0; dim * proxy_count];
                let mut basis = [vec![0.0; degree + 1], vec![0.0; degree + 1], vec![0.0; degree + 1]];
                for i in cluster.begin..cluster.end {
                    for (axis, basis_axis) in basis.iter_mut().enumerate() {
                        let t = if half[axis] > 0.0 {
                            ((points[3 * i + axis] - cluster.center[axis]) / half[axis])
                                .clamp(-1.0, 1.0)
                        } else {
                            0.0
                        };
                        lagrange_basis(t, &nodes, &weights, basis_axis);
                    }
                    let strength = &strengths[dim * i..dim * (i + 1)];
                    let mut k = 0;
                    for a in 0..=degree {
                        for b in 0..=degree {
                            let lab = basis[0][a] * basis[1][b];
                            for c in 0..=degree {
                                let l = lab * basis[2][c];
                                for (p, s) in proxy_strengths[dim * k..dim * (k + 1)]
                                    .iter_mut()
                                    .zip(strength)
                                {
                                    *p += l * s;
                                }
                                k += 1;
                            }
                        }
                    }
                }

                cluster.proxy_points = proxy_points;
                cluster.proxy_strengths = proxy_strengths;
            });
    }

    fn evaluate_target(
        &self,
        target: &[f64],
        theta: f64,
        factor: f64,
        reg: &Regularization,
        result: &mut [f64],
    ) {
        if self.clusters.is_empty() {
            return;
        }
        let dim = self.kind.strength_dim();
        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            let cluster = &self.clusters[index];
            let (_, dist2) = separation(target, &cluster.center);
            if cluster.has_proxies() && cluster.radius < theta * dist2.sqrt() {
                self.interact(
                    target,
                    &cluster.proxy_points,
                    &cluster.proxy_strengths,
                    dim,
                    factor,
                    reg,
                    result,
                );
            } else if cluster.children.is_empty() {
                self.interact(
                    target,
                    &self.points[3 * cluster.begin..3 * cluster.end],
                    &self.strengths[dim * cluster.begin..dim * cluster.end],
                    dim,
                    factor,
                    reg,
                    result,
                );
            } else {
                stack.extend_from_slice(&cluster.children);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn interact(
        &self,
        target: &[f64],
        sources: &[f64],
        strengths: &[f64],
        dim: usize,
        factor: f64,
        reg: &Regularization,
        result: &mut [f64],
    ) {
        for (source, strength) in sources.chunks_exact(3).zip(strengths.chunks_exact(dim)) {
            let (dr, r2) = separation(target, source);
            match self.kind {
                SourceKind::Stokeslet => {
                    if let Some((inv_r, inv_r3)) = reg.oseen(r2) {
                        add_stokeslet(factor, &dr, inv_r, inv_r3, strength, result);
                    }
                }
                SourceKind::Stresslet => {
                    if r2 > 0.0 {
                        let r = reg.stresslet_distance(r2);
                        add_double_layer_tensor(factor, &dr, r, strength, result);
                    }
                }
            }
        }
    }
}

/// Treecode evaluator of the Stokes kernels.
///
/// The tree of the last evaluation is kept until the next evaluation or until
/// [Treecode::clear] is called. Every evaluation starts from an empty tree.
pub struct Treecode {
    eta: f64,
    regularization: Regularization,
    options: TreecodeOptions,
    use_multithreaded: bool,
    tree: RefCell<Option<SourceTree>>,
}

impl std::fmt::Debug for Treecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Treecode with theta {} and degree {}",
            self.options.theta(),
            self.options.degree()
        )
    }
}

impl Treecode {
    /// Create a new treecode evaluator.
    pub fn new(eta: f64, options: &KernelOptions) -> Self {
        Self {
            eta,
            regularization: Regularization::new(options),
            options: options.treecode().clone(),
            use_multithreaded: options.use_multithreaded(),
            tree: RefCell::new(None),
        }
    }

    /// Whether a tree from a previous evaluation is currently held.
    pub fn is_populated(&self) -> bool {
        self.tree.borrow().is_some()
    }

    /// Number of clusters in the currently held tree.
    pub fn cluster_count(&self) -> usize {
        self.tree
            .borrow()
            .as_ref()
            .map_or(0, |tree| tree.clusters.len())
    }

    fn evaluate(
        &self,
        kind: SourceKind,
        eval_type: EvalType,
        sources: &[f64],
        strengths: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        self.clear();
        let tree = SourceTree::new(kind, sources, strengths, &self.options);
        debug!(
            "Treecode: {} sources in {} clusters, {} targets",
            sources.len() / 3,
            tree.clusters.len(),
            targets.len() / 3
        );
        let factor = match kind {
            SourceKind::Stokeslet => oseen_factor(self.eta),
            SourceKind::Stresslet => stresslet_factor(self.eta),
        };
        let theta = self.options.theta();
        let reg = self.regularization;
        let range_dim = eval_type.component_count();

        result.fill(0.0);
        let evaluate = |(target_index, my_chunk): (usize, &mut [f64])| {
            tree.evaluate_target(
                &targets[3 * target_index..3 * target_index + 3],
                theta,
                factor,
                &reg,
                my_chunk,
            )
        };
        if self.use_multithreaded {
            result
                .par_chunks_exact_mut(range_dim)
                .enumerate()
                .for_each(evaluate);
        } else {
            result.chunks_exact_mut(range_dim).enumerate().for_each(evaluate);
        }

        *self.tree.borrow_mut() = Some(tree);
    }
}

impl StokesEvaluator for Treecode {
    fn evaluate_single_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        forces: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        check_dimensions(sources, &[forces], targets);
        check_result(eval_type, targets, result);
        self.evaluate(SourceKind::Stokeslet, eval_type, sources, forces, targets, result);
    }

    fn evaluate_double_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        normals: &[f64],
        densities: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        check_dimensions(sources, &[normals, densities], targets);
        check_result(eval_type, targets, result);
        let tensors: Vec<f64> = normals
            .chunks_exact(3)
            .zip(densities.chunks_exact(3))
            .flat_map(|(n, q)| {
                [
                    q[0] * n[0],
                    q[0] * n[1],
                    q[0] * n[2],
                    q[1] * n[0],
                    q[1] * n[1],
                    q[1] * n[2],
                    q[2] * n[0],
                    q[2] * n[1],
                    q[2] * n[2],
                ]
            })
            .collect();
        self.evaluate(SourceKind::Stresslet, eval_type, sources, &tensors, targets, result);
    }

    fn clear(&self) {
        *self.tree.borrow_mut() = None;
    }
}
