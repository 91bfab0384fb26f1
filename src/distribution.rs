//! Distribution of the periphery across processes and the collectives the system needs.
use crate::types::{Error, Result};

/// Per-process counts and displacements of one distributed quantity.
///
/// `displacements` has one more entry than `counts` and ends with the global total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    counts: Vec<usize>,
    displacements: Vec<usize>,
}

impl Layout {
    fn from_counts(counts: Vec<usize>) -> Self {
        let mut displacements = Vec::with_capacity(counts.len() + 1);
        displacements.push(0);
        for c in &counts {
            displacements.push(displacements[displacements.len() - 1] + c);
        }
        Self {
            counts,
            displacements,
        }
    }

    /// Counts per process.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Exclusive prefix sums of the counts, followed by the total.
    pub fn displacements(&self) -> &[usize] {
        &self.displacements
    }

    /// Sum of all counts.
    pub fn total(&self) -> usize {
        self.displacements[self.displacements.len() - 1]
    }

    /// Index range owned by `rank`.
    pub fn range(&self, rank: usize) -> std::ops::Range<usize> {
        self.displacements[rank]..self.displacements[rank + 1]
    }
}

/// How the periphery nodes are split between processes.
///
/// Nodes are divided as evenly as possible, the first `n % world_size` ranks taking
/// one extra node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    rank: usize,
    world_size: usize,
    n_nodes_global: usize,
    nodes: Layout,
    quadrature: Layout,
    rows: Layout,
}

impl DistributionPlan {
    /// Plan the distribution of `n_nodes_global` periphery nodes.
    pub fn new(rank: usize, world_size: usize, n_nodes_global: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::InvalidParameter(format!(
                "rank {rank} outside of world of size {world_size}"
            )));
        }
        let quad_counts: Vec<usize> = (0..world_size)
            .map(|r| n_nodes_global / world_size + usize::from(r < n_nodes_global % world_size))
            .collect();
        let node_counts = quad_counts.iter().map(|n| 3 * n).collect();
        let row_counts = quad_counts
            .iter()
            .map(|n| 3 * n * 3 * n_nodes_global)
            .collect();
        Ok(Self {
            rank,
            world_size,
            n_nodes_global,
            nodes: Layout::from_counts(node_counts),
            quadrature: Layout::from_counts(quad_counts),
            rows: Layout::from_counts(row_counts),
        })
    }

    /// Plan for a single process owning every node.
    pub fn single_process(n_nodes_global: usize) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            n_nodes_global,
            nodes: Layout::from_counts(vec![3 * n_nodes_global]),
            quadrature: Layout::from_counts(vec![n_nodes_global]),
            rows: Layout::from_counts(vec![9 * n_nodes_global * n_nodes_global]),
        }
    }

    /// Rank this plan was made for.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of processes.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of nodes across all processes.
    pub fn n_nodes_global(&self) -> usize {
        self.n_nodes_global
    }

    /// Number of nodes on this process.
    pub fn n_nodes_local(&self) -> usize {
        self.quadrature.counts()[self.rank]
    }

    /// Node coordinate layout, three values per node.
    pub fn nodes(&self) -> &Layout {
        &self.nodes
    }

    /// Quadrature weight layout, one value per node.
    pub fn quadrature(&self) -> &Layout {
        &self.quadrature
    }

    /// Layout of the dense operator entries, one full row block per node.
    pub fn rows(&self) -> &Layout {
        &self.rows
    }
}

/// The collective operations used by the coupled system.
pub trait Communicator {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of processes.
    fn size(&self) -> usize;

    /// Concatenate the local slices of all processes in rank order.
    ///
    /// `counts[r]` is the length contributed by rank `r`.
    fn all_gather_varcount(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>>;

    /// Element-wise sum over all processes.
    fn all_reduce_sum(&self, local: &[f64]) -> Result<Vec<f64>>;
}

/// Communicator of a run without MPI.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_varcount(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
        if counts != [local.len()] {
            return Err(Error::Communication(format!(
                "single process gather of {} values with counts {counts:?}",
                local.len()
            )));
        }
        Ok(local.to_vec())
    }

    fn all_reduce_sum(&self, local: &[f64]) -> Result<Vec<f64>> {
        Ok(local.to_vec())
    }
}

#[cfg(feature = "mpi")]
mod parallel {
    use super::Communicator;
    use crate::types::{Error, Result};
    use mpi::collective::SystemOperation;
    use mpi::datatype::PartitionMut;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as MpiCommunicator, CommunicatorCollectives};
    use mpi::Count;

    fn to_count(value: usize) -> Result<Count> {
        Count::try_from(value)
            .map_err(|_| Error::Communication(format!("count {value} exceeds the MPI range")))
    }

    impl Communicator for SimpleCommunicator {
        fn rank(&self) -> usize {
            MpiCommunicator::rank(self) as usize
        }

        fn size(&self) -> usize {
            MpiCommunicator::size(self) as usize
        }

        fn all_gather_varcount(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
            if counts.len() != Communicator::size(self) {
                return Err(Error::Communication(format!(
                    "{} counts for {} processes",
                    counts.len(),
                    Communicator::size(self)
                )));
            }
            if counts[Communicator::rank(self)] != local.len() {
                return Err(Error::Communication(format!(
                    "rank {} contributes {} values, expected {}",
                    Communicator::rank(self),
                    local.len(),
                    counts[Communicator::rank(self)]
                )));
            }
            let mpi_counts = counts
                .iter()
                .map(|c| to_count(*c))
                .collect::<Result<Vec<_>>>()?;
            let mut displacements = Vec::with_capacity(counts.len());
            let mut offset = 0;
            for c in counts {
                displacements.push(to_count(offset)?);
                offset += c;
            }
            let mut global = vec![0.0; offset];
            {
                let mut partition =
                    PartitionMut::new(&mut global[..], &mpi_counts[..], &displacements[..]);
                self.all_gather_varcount_into(local, &mut partition);
            }
            Ok(global)
        }

        fn all_reduce_sum(&self, local: &[f64]) -> Result<Vec<f64>> {
            let mut global = vec![0.0; local.len()];
            self.all_reduce_into(local, &mut global[..], SystemOperation::sum());
            Ok(global)
        }
    }
}
