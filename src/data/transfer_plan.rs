//! Byte layouts of the send and receive buffers of one transfer.
//!
//! A [`TransferPlan`] is an immutable value computed from field layouts and a
//! [`PartitionIndex`]; it holds one `(offset, len)` table indexed by field and
//! one indexed by peer rank, both exclusive prefix sums. Two layouts exist:
//!
//! * **field-major** ([`plan_send`]): each field is one contiguous run of its
//!   local elements; fields are grouped by owner so that the bytes bound for
//!   one peer are contiguous. With fields in owner order (as the engines
//!   arrange them) field offsets are plain prefix sums in field order.
//! * **peer-major** ([`plan_receive`]): one block per peer rank holding that
//!   peer's `count_of(peer)` elements for every field the local rank owns,
//!   field after field, in local-slot order.
//!
//! A gather sends field-major and receives peer-major; a scatter does the
//! reverse with the same two plans.

use itertools::Itertools;
use std::ops::Range;

use crate::data::field_view::FieldLayout;
use crate::data::partition_index::PartitionIndex;
use crate::debug_invariants::DebugInvariants;
use crate::exchange_error::ExchangeError;

/// `(offset, len)` byte run inside a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub offset: usize,
    pub len: usize,
}

impl Extent {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Exclusive prefix sum of `lens`.
fn prefix_extents(lens: impl IntoIterator<Item = usize>) -> Vec<Extent> {
    lens.into_iter()
        .scan(0usize, |acc, len| {
            let e = Extent { offset: *acc, len };
            *acc += len;
            Some(e)
        })
        .collect()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanLayout {
    FieldMajor,
    PeerMajor,
}

/// Per-field and per-peer byte extents of one buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    layout: PlanLayout,
    fields: Vec<Extent>,
    peers: Vec<Extent>,
    /// Peer-major only: each field's `(offset, width)` inside one element row.
    rows: Vec<Extent>,
    owners: Vec<usize>,
    peer_counts: Vec<usize>,
}

fn check_owner(field: usize, owner: usize, nb_partitions: usize) -> Result<(), ExchangeError> {
    if owner < nb_partitions {
        Ok(())
    } else {
        Err(ExchangeError::InvalidOwner {
            field,
            owner,
            nb_partitions,
        })
    }
}

/// Field-major plan over the local (partitioned) side of a transfer.
///
/// Field length is `len × elem_size`; the whole field is addressed to its owner.
///
/// # Errors
/// [`ExchangeError::SizeMismatch`] if a field does not hold exactly
/// `index.count_of(local_rank)` elements, [`ExchangeError::InvalidOwner`] for
/// an owner outside the index.
pub fn plan_send(
    fields: &[FieldLayout],
    index: &PartitionIndex,
    local_rank: usize,
) -> Result<TransferPlan, ExchangeError> {
    let nb = index.nb_partitions();
    let expected = index.count_of(local_rank);
    let mut peer_lens = vec![0usize; nb];
    for (f, field) in fields.iter().enumerate() {
        check_owner(f, field.owner, nb)?;
        if field.len != expected {
            return Err(ExchangeError::SizeMismatch {
                field: f,
                what: "local element count",
                expected,
                found: field.len,
            });
        }
        peer_lens[field.owner] += field.len * field.elem_size;
    }
    let peers = prefix_extents(peer_lens);

    let mut cursor: Vec<usize> = peers.iter().map(|e| e.offset).collect();
    let field_extents = fields
        .iter()
        .map(|field| {
            let len = field.len * field.elem_size;
            let offset = cursor[field.owner];
            cursor[field.owner] += len;
            Extent { offset, len }
        })
        .collect();

    let plan = TransferPlan {
        layout: PlanLayout::FieldMajor,
        fields: field_extents,
        peers,
        rows: Vec::new(),
        owners: fields.iter().map(|f| f.owner).collect(),
        peer_counts: Vec::new(),
    };
    plan.debug_assert_invariants();
    Ok(plan)
}

/// Peer-major plan over the global (canonical) side of a transfer.
///
/// Only fields owned by `local_rank` take part: each spans `N × elem_size`
/// bytes, and peer `p` contributes `count_of(p) × Σ widths` bytes.
///
/// # Errors
/// [`ExchangeError::SizeMismatch`] if an owned field does not hold exactly
/// `index.len()` elements, [`ExchangeError::InvalidOwner`] for an owner
/// outside the index.
pub fn plan_receive(
    fields: &[FieldLayout],
    index: &PartitionIndex,
    local_rank: usize,
) -> Result<TransferPlan, ExchangeError> {
    let nb = index.nb_partitions();
    let n = index.len();
    let mut widths = Vec::with_capacity(fields.len());
    for (f, field) in fields.iter().enumerate() {
        check_owner(f, field.owner, nb)?;
        if field.owner == local_rank {
            if field.len != n {
                return Err(ExchangeError::SizeMismatch {
                    field: f,
                    what: "global element count",
                    expected: n,
                    found: field.len,
                });
            }
            widths.push(field.elem_size);
        } else {
            widths.push(0);
        }
    }
    let rows = prefix_extents(widths);
    let row_width = rows.last().map_or(0, Extent::end);
    let peer_counts: Vec<usize> = index.counts().to_vec();
    let peers = prefix_extents(peer_counts.iter().map(|&c| c * row_width));
    let field_extents = rows
        .iter()
        .map(|r| Extent {
            offset: n * r.offset,
            len: n * r.len,
        })
        .collect();

    let plan = TransferPlan {
        layout: PlanLayout::PeerMajor,
        fields: field_extents,
        peers,
        rows,
        owners: fields.iter().map(|f| f.owner).collect(),
        peer_counts,
    };
    plan.debug_assert_invariants();
    Ok(plan)
}

impl TransferPlan {
    pub fn layout(&self) -> PlanLayout {
        self.layout
    }

    pub fn fields(&self) -> &[Extent] {
        &self.fields
    }

    pub fn peers(&self) -> &[Extent] {
        &self.peers
    }

    pub fn field(&self, field: usize) -> Extent {
        self.fields.get(field).copied().unwrap_or_default()
    }

    pub fn peer(&self, peer: usize) -> Extent {
        self.peers.get(peer).copied().unwrap_or_default()
    }

    /// Buffer size in bytes.
    pub fn total(&self) -> usize {
        self.peers.last().map_or(0, Extent::end)
    }

    /// Byte range holding `field`'s data exchanged with `peer`, if any.
    pub fn segment(&self, peer: usize, field: usize) -> Option<Range<usize>> {
        match self.layout {
            PlanLayout::FieldMajor => {
                let e = *self.fields.get(field)?;
                (self.owners[field] == peer && e.len > 0).then(|| e.range())
            }
            PlanLayout::PeerMajor => {
                let row = *self.rows.get(field)?;
                let count = *self.peer_counts.get(peer)?;
                if row.len == 0 || count == 0 {
                    return None;
                }
                let start = self.peers[peer].offset + count * row.offset;
                Some(start..start + count * row.len)
            }
        }
    }

    /// Peer-major only: bytes of one element of `field`.
    pub fn row_width(&self, field: usize) -> usize {
        self.rows.get(field).map_or(0, |r| r.len)
    }
}

impl DebugInvariants for TransferPlan {
    fn validate_invariants(&self) -> Result<(), ExchangeError> {
        let by_field: usize = self.fields.iter().map(|e| e.len).sum();
        let by_peer: usize = self.peers.iter().map(|e| e.len).sum();
        if by_field != by_peer {
            return Err(ExchangeError::SizeMismatch {
                field: self.fields.len(),
                what: "bytes conserved between field and peer tables",
                expected: by_peer,
                found: by_field,
            });
        }
        let contiguous = |table: &[Extent]| {
            table.first().is_none_or(|e| e.offset == 0)
                && table.iter().tuple_windows().all(|(a, b)| a.end() == b.offset)
        };
        if !contiguous(&self.peers) || !contiguous(&self.rows) {
            return Err(ExchangeError::SizeMismatch {
                field: 0,
                what: "prefix-sum offsets",
                expected: by_peer,
                found: self.total(),
            });
        }
        if let Some((f, e)) = self.fields.iter().find_position(|e| e.end() > self.total()) {
            return Err(ExchangeError::SizeMismatch {
                field: f,
                what: "field extent end",
                expected: self.total(),
                found: e.end(),
            });
        }
        Ok(())
    }
}

/// Split `buf` into one disjoint mutable segment per extent, in extent order.
///
/// # Errors
/// [`ExchangeError::SizeMismatch`] if extents overlap or run past `buf`.
pub fn split_segments_mut<'b>(
    buf: &'b mut [u8],
    extents: &[Extent],
) -> Result<Vec<&'b mut [u8]>, ExchangeError> {
    let order = (0..extents.len()).sorted_by_key(|&i| extents[i].offset);
    let mut rest = buf;
    let mut pos = 0usize;
    let mut pieces: Vec<(usize, &'b mut [u8])> = Vec::with_capacity(extents.len());
    for i in order {
        let e = extents[i];
        if e.offset < pos || e.end() - pos > rest.len() {
            return Err(ExchangeError::SizeMismatch {
                field: i,
                what: "buffer segment end",
                expected: pos + rest.len(),
                found: e.end(),
            });
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(e.offset - pos);
        let (piece, tail) = tail.split_at_mut(e.len);
        pieces.push((i, piece));
        rest = tail;
        pos = e.end();
    }
    pieces.sort_by_key(|(i, _)| *i);
    Ok(pieces.into_iter().map(|(_, p)| p).collect())
}
