//! Bidirectional mapping between global indices and `(rank, local offset)` pairs.
//!
//! [`PartitionIndex`] is built once per partition assignment and then shared
//! read-only by any number of transfers. Local offsets are handed out in
//! **ascending global-index order** within each rank; this is the canonical
//! order every gather and scatter relies on (rank blocks ascending, and inside
//! a block ascending global index).

use crate::debug_invariants::DebugInvariants;
use crate::exchange_error::ExchangeError;
use serde::{Deserialize, Serialize};

/// Padding value for unused `(rank, local)` slots of the flat table.
pub const HOLE: usize = usize::MAX;

/// Where a global index lives: owning rank and offset inside that rank's partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub rank: usize,
    pub local: usize,
}

/// Partition assignment supplied by an external distribution/partitioning step.
pub trait Distribution {
    /// Number of global indices.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of partitions (processes).
    fn nb_partitions(&self) -> usize;

    /// Rank storing global index `global`.
    fn partition(&self, global: usize) -> usize;

    /// Per-rank counts the distribution claims, if it carries them.
    fn declared_counts(&self) -> Option<&[usize]> {
        None
    }
}

/// Contiguous, balanced distribution: the first `len % nb_partitions` ranks
/// hold one extra index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDistribution {
    len: usize,
    counts: Vec<usize>,
}

impl BlockDistribution {
    pub fn new(len: usize, nb_partitions: usize) -> Self {
        let counts = if nb_partitions == 0 {
            Vec::new()
        } else {
            let (base, rem) = (len / nb_partitions, len % nb_partitions);
            (0..nb_partitions)
                .map(|r| base + usize::from(r < rem))
                .collect()
        };
        Self { len, counts }
    }
}

impl Distribution for BlockDistribution {
    fn len(&self) -> usize {
        self.len
    }

    fn nb_partitions(&self) -> usize {
        self.counts.len()
    }

    fn partition(&self, global: usize) -> usize {
        let n = self.counts.len().max(1);
        let (base, rem) = (self.len / n, self.len % n);
        let wide = rem * (base + 1);
        if global < wide {
            global / (base + 1)
        } else {
            rem + (global - wide) / base.max(1)
        }
    }

    fn declared_counts(&self) -> Option<&[usize]> {
        Some(&self.counts)
    }
}

/// Global ↔ `(rank, local)` tables for one partition assignment.
///
/// Deserialized indices are validated before use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPartitionIndex")]
pub struct PartitionIndex {
    nb_partitions: usize,
    max_count: usize,
    counts: Vec<usize>,
    /// `nb_partitions × max_count`, row `r` valid up to `counts[r]`, rest [`HOLE`].
    prcloc2glo: Vec<usize>,
    glo2prcloc: Vec<Location>,
}

/// Unchecked wire form of [`PartitionIndex`].
#[derive(Deserialize)]
struct RawPartitionIndex {
    nb_partitions: usize,
    max_count: usize,
    counts: Vec<usize>,
    prcloc2glo: Vec<usize>,
    glo2prcloc: Vec<Location>,
}

impl TryFrom<RawPartitionIndex> for PartitionIndex {
    type Error = ExchangeError;

    fn try_from(raw: RawPartitionIndex) -> Result<Self, Self::Error> {
        let index = PartitionIndex {
            nb_partitions: raw.nb_partitions,
            max_count: raw.max_count,
            counts: raw.counts,
            prcloc2glo: raw.prcloc2glo,
            glo2prcloc: raw.glo2prcloc,
        };
        index.validate_invariants()?;
        Ok(index)
    }
}

impl PartitionIndex {
    /// Build from an explicit assignment `assignment[global] = rank`.
    ///
    /// # Errors
    /// [`ExchangeError::InvalidPartition`] if any rank is `>= nb_partitions`.
    pub fn build(assignment: &[usize], nb_partitions: usize) -> Result<Self, ExchangeError> {
        Self::build_with(assignment.len(), nb_partitions, |g| assignment[g])
    }

    /// Build from a [`Distribution`], cross-checking its declared counts.
    ///
    /// # Errors
    /// [`ExchangeError::InvalidPartition`] for out-of-range ranks and
    /// [`ExchangeError::PartitionCountMismatch`] when declared counts disagree.
    pub fn from_distribution<D: Distribution + ?Sized>(dist: &D) -> Result<Self, ExchangeError> {
        let index = Self::build_with(dist.len(), dist.nb_partitions(), |g| dist.partition(g))?;
        if let Some(declared) = dist.declared_counts() {
            let ranks = declared.len().max(index.nb_partitions);
            for rank in 0..ranks {
                let expected = declared.get(rank).copied().unwrap_or(0);
                let found = index.count_of(rank);
                if expected != found {
                    return Err(ExchangeError::PartitionCountMismatch {
                        rank,
                        expected,
                        found,
                    });
                }
            }
        }
        Ok(index)
    }

    fn build_with(
        len: usize,
        nb_partitions: usize,
        partition: impl Fn(usize) -> usize,
    ) -> Result<Self, ExchangeError> {
        let mut counts = vec![0usize; nb_partitions];
        let mut glo2prcloc = Vec::with_capacity(len);
        for global in 0..len {
            let rank = partition(global);
            let slot = counts
                .get_mut(rank)
                .ok_or(ExchangeError::InvalidPartition {
                    global,
                    rank,
                    nb_partitions,
                })?;
            glo2prcloc.push(Location { rank, local: *slot });
            *slot += 1;
        }

        let max_count = counts.iter().copied().max().unwrap_or(0);
        let mut prcloc2glo = vec![HOLE; nb_partitions * max_count];
        for (global, loc) in glo2prcloc.iter().enumerate() {
            prcloc2glo[loc.rank * max_count + loc.local] = global;
        }

        log::debug!(
            "partition index: {len} points over {nb_partitions} ranks, at most {max_count} per rank"
        );
        let index = Self {
            nb_partitions,
            max_count,
            counts,
            prcloc2glo,
            glo2prcloc,
        };
        index.debug_assert_invariants();
        Ok(index)
    }

    /// Number of global indices `N`.
    pub fn len(&self) -> usize {
        self.glo2prcloc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glo2prcloc.is_empty()
    }

    pub fn nb_partitions(&self) -> usize {
        self.nb_partitions
    }

    /// Largest per-rank count (row width of the flat table).
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Per-rank element counts.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Elements stored on `rank` (0 for unknown ranks).
    pub fn count_of(&self, rank: usize) -> usize {
        self.counts.get(rank).copied().unwrap_or(0)
    }

    /// Global index of local slot `local` on `rank`, in O(1).
    pub fn global_of(&self, rank: usize, local: usize) -> Option<usize> {
        (local < self.count_of(rank)).then(|| self.prcloc2glo[rank * self.max_count + local])
    }

    /// Owning rank and local slot of `global`, in O(1).
    pub fn location_of(&self, global: usize) -> Option<Location> {
        self.glo2prcloc.get(global).copied()
    }

    /// Global indices held by `rank`, in local-slot order (ascending).
    pub fn globals_of(&self, rank: usize) -> &[usize] {
        let count = self.count_of(rank);
        if count == 0 {
            return &[];
        }
        let start = rank * self.max_count;
        &self.prcloc2glo[start..start + count]
    }
}

impl DebugInvariants for PartitionIndex {
    fn validate_invariants(&self) -> Result<(), ExchangeError> {
        let broken = |global, rank| ExchangeError::InvalidPartition {
            global,
            rank,
            nb_partitions: self.nb_partitions,
        };
        let table = |what: String| ExchangeError::InvalidShape(format!("partition index: {what}"));
        if self.counts.len() != self.nb_partitions {
            return Err(table(format!(
                "{} counts for {} partitions",
                self.counts.len(),
                self.nb_partitions
            )));
        }
        if let Some(rank) = self.counts.iter().position(|&c| c > self.max_count) {
            return Err(table(format!(
                "rank {rank} holds {} points, row width is {}",
                self.counts[rank], self.max_count
            )));
        }
        if self.nb_partitions.checked_mul(self.max_count) != Some(self.prcloc2glo.len()) {
            return Err(table(format!(
                "local-to-global table has {} slots, expected {} × {}",
                self.prcloc2glo.len(),
                self.nb_partitions,
                self.max_count
            )));
        }
        let total = self
            .counts
            .iter()
            .try_fold(0usize, |acc, &c| acc.checked_add(c));
        if total != Some(self.len()) {
            return Err(broken(self.len(), self.nb_partitions));
        }
        for (global, loc) in self.glo2prcloc.iter().enumerate() {
            if self.global_of(loc.rank, loc.local) != Some(global) {
                return Err(broken(global, loc.rank));
            }
        }
        for rank in 0..self.nb_partitions {
            let row = &self.prcloc2glo[rank * self.max_count..(rank + 1) * self.max_count];
            let (valid, padding) = row.split_at(self.count_of(rank));
            if !valid.windows(2).all(|w| w[0] < w[1]) || padding.iter().any(|&g| g != HOLE) {
                return Err(broken(valid.first().copied().unwrap_or(HOLE), rank));
            }
        }
        Ok(())
    }
}
