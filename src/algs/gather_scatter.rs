//! Gather partitioned fields into canonical global order, and scatter them back.
//!
//! Both directions run the same pipeline:
//!
//! 1. reorder the field pairs by owner rank (stable) and validate them;
//! 2. propagate each global descriptor's owner onto its local descriptor;
//! 3. plan the send and receive buffers ([`plan_send`], [`plan_receive`]);
//! 4. pack, 5. exchange ([`exchange_bytes`]), 6. unpack.
//!
//! A gather leaves on each owner rank the global field with element `g` taken
//! from slot `location_of(g).local` of rank `location_of(g).rank`. Every
//! destination byte has exactly one source, so the result depends only on the
//! partition assignment and the field content, never on delivery order or on
//! how pack/unpack work is spread over threads.

use itertools::Itertools;
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::algs::communicator::{CommTag, Communicator, GATHER_TAG, SCATTER_TAG};
use crate::algs::exchange::{TransferStats, exchange_bytes, plan_routes};
use crate::data::field_view::{FieldLayout, FieldView};
use crate::data::partition_index::PartitionIndex;
use crate::data::transfer_plan::{TransferPlan, plan_receive, plan_send, split_segments_mut};
use crate::exchange_error::ExchangeError;

/// Gather/scatter engine bound to one partition index.
#[derive(Clone, Debug)]
pub struct GatherScatter<'p> {
    index: &'p PartitionIndex,
    gather_tag: CommTag,
    scatter_tag: CommTag,
}

impl<'p> GatherScatter<'p> {
    pub fn new(index: &'p PartitionIndex) -> Self {
        Self {
            index,
            gather_tag: GATHER_TAG,
            scatter_tag: SCATTER_TAG,
        }
    }

    pub fn with_gather_tag(mut self, tag: CommTag) -> Self {
        self.gather_tag = tag;
        self
    }

    pub fn with_scatter_tag(mut self, tag: CommTag) -> Self {
        self.scatter_tag = tag;
        self
    }

    pub fn index(&self) -> &'p PartitionIndex {
        self.index
    }

    /// Collect `local` (partitioned) fields into `global` (canonical) fields.
    ///
    /// Field `f` of `local` pairs with field `f` of `global`. Each rank owning a
    /// global field must pass a writable view of `index.len()` elements; other
    /// ranks may pass [`FieldView::placeholder`]s. Every local view must hold
    /// `index.count_of(comm.rank())` elements.
    ///
    /// # Errors
    /// Validation errors are raised before anything is posted to `comm`;
    /// [`ExchangeError::CommunicationFailure`] after all handles are drained.
    pub fn gather<C: Communicator>(
        &self,
        comm: &C,
        local: &mut [FieldView<'_>],
        global: &mut [FieldView<'_>],
    ) -> Result<TransferStats, ExchangeError> {
        let me = comm.rank();
        let order = self.pair_fields(comm, local, global)?;
        let local_layouts = layouts_in(local, &order);
        let global_layouts = layouts_in(global, &order);

        let send_plan = plan_send(&local_layouts, self.index, me).map_err(|e| remap(e, &order))?;
        let recv_plan =
            plan_receive(&global_layouts, self.index, me).map_err(|e| remap(e, &order))?;
        require_writable(global, &order, |k| recv_plan.row_width(k) > 0)?;
        log::debug!(
            "gather on rank {me}: {} fields, send {} bytes, receive {} bytes",
            order.len(),
            send_plan.total(),
            recv_plan.total()
        );

        let mut send_buf = vec![0u8; send_plan.total()];
        let sources: Vec<&FieldView<'_>> = order.iter().map(|&f| &local[f]).collect();
        pack_field_major(&mut send_buf, &send_plan, &sources)?;

        let mut recv_buf = vec![0u8; recv_plan.total()];
        let stats = exchange_bytes(
            comm,
            self.gather_tag,
            &send_buf,
            &plan_routes(&send_plan),
            &mut recv_buf,
            &plan_routes(&recv_plan),
        )?;

        for (k, view) in in_order(global, &order).into_iter().enumerate() {
            unpack_peer_major(&recv_buf, &recv_plan, k, self.index, view);
        }
        log::debug!("gather on rank {me} done: {stats:?}");
        Ok(stats)
    }

    /// Distribute `global` (canonical) fields into `local` (partitioned) fields.
    ///
    /// The structural inverse of [`gather`](Self::gather): owners pack, for each
    /// destination rank, the elements that rank stores, and every rank unpacks
    /// into its local views at local offsets.
    pub fn scatter<C: Communicator>(
        &self,
        comm: &C,
        global: &mut [FieldView<'_>],
        local: &mut [FieldView<'_>],
    ) -> Result<TransferStats, ExchangeError> {
        let me = comm.rank();
        let order = self.pair_fields(comm, local, global)?;
        let local_layouts = layouts_in(local, &order);
        let global_layouts = layouts_in(global, &order);

        let send_plan =
            plan_receive(&global_layouts, self.index, me).map_err(|e| remap(e, &order))?;
        let recv_plan = plan_send(&local_layouts, self.index, me).map_err(|e| remap(e, &order))?;
        require_writable(local, &order, |k| recv_plan.field(k).len > 0)?;
        log::debug!(
            "scatter on rank {me}: {} fields, send {} bytes, receive {} bytes",
            order.len(),
            send_plan.total(),
            recv_plan.total()
        );

        let mut send_buf = vec![0u8; send_plan.total()];
        for (k, &f) in order.iter().enumerate() {
            pack_peer_major(&mut send_buf, &send_plan, k, self.index, &global[f]);
        }

        let mut recv_buf = vec![0u8; recv_plan.total()];
        let stats = exchange_bytes(
            comm,
            self.scatter_tag,
            &send_buf,
            &plan_routes(&send_plan),
            &mut recv_buf,
            &plan_routes(&recv_plan),
        )?;

        unpack_field_major(&recv_buf, &recv_plan, in_order(local, &order));
        log::debug!("scatter on rank {me} done: {stats:?}");
        Ok(stats)
    }

    /// Validate the field pairing and return the owner-sorted field order.
    ///
    /// Owners come from the global descriptors and are copied onto the local
    /// ones only once every pair has been validated.
    fn pair_fields<C: Communicator>(
        &self,
        comm: &C,
        local: &mut [FieldView<'_>],
        global: &[FieldView<'_>],
    ) -> Result<Vec<usize>, ExchangeError> {
        if local.len() != global.len() {
            return Err(ExchangeError::FieldCountMismatch {
                local: local.len(),
                global: global.len(),
            });
        }
        let nb_partitions = self.index.nb_partitions();
        if comm.size() != nb_partitions {
            return Err(ExchangeError::CommunicatorMismatch {
                comm_size: comm.size(),
                nb_partitions,
            });
        }
        for (field, (loc, glo)) in local.iter().zip(global).enumerate() {
            if glo.owner() >= nb_partitions {
                return Err(ExchangeError::InvalidOwner {
                    field,
                    owner: glo.owner(),
                    nb_partitions,
                });
            }
            if loc.elem_size() != glo.elem_size() {
                return Err(ExchangeError::SizeMismatch {
                    field,
                    what: "element byte size",
                    expected: glo.elem_size(),
                    found: loc.elem_size(),
                });
            }
        }
        for (loc, glo) in local.iter_mut().zip(global) {
            loc.set_owner(glo.owner());
        }
        Ok((0..global.len())
            .sorted_by_key(|&f| global[f].owner())
            .collect())
    }
}

fn layouts_in(views: &[FieldView<'_>], order: &[usize]) -> Vec<FieldLayout> {
    order.iter().map(|&f| views[f].layout()).collect()
}

/// Mutable references to `items` in `order`.
fn in_order<'s, T>(items: &'s mut [T], order: &[usize]) -> Vec<&'s mut T> {
    let mut slots: Vec<Option<&'s mut T>> = items.iter_mut().map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}

/// Translate an owner-sorted field position back to the caller's field index.
fn remap(err: ExchangeError, order: &[usize]) -> ExchangeError {
    let back = |k: usize| order.get(k).copied().unwrap_or(k);
    match err {
        ExchangeError::SizeMismatch {
            field,
            what,
            expected,
            found,
        } => ExchangeError::SizeMismatch {
            field: back(field),
            what,
            expected,
            found,
        },
        ExchangeError::InvalidOwner {
            field,
            owner,
            nb_partitions,
        } => ExchangeError::InvalidOwner {
            field: back(field),
            owner,
            nb_partitions,
        },
        other => other,
    }
}

fn require_writable(
    views: &[FieldView<'_>],
    order: &[usize],
    receives: impl Fn(usize) -> bool,
) -> Result<(), ExchangeError> {
    match order
        .iter()
        .enumerate()
        .find(|&(k, &f)| receives(k) && !views[f].is_writable())
    {
        Some((_, &field)) => Err(ExchangeError::ReadOnlyView { field }),
        None => Ok(()),
    }
}

/// Copy each source view into its field extent. Fields are independent.
fn pack_field_major(
    buf: &mut [u8],
    plan: &TransferPlan,
    sources: &[&FieldView<'_>],
) -> Result<(), ExchangeError> {
    let segments = split_segments_mut(buf, plan.fields())?;
    #[cfg(feature = "rayon")]
    segments
        .into_par_iter()
        .zip(sources.par_iter())
        .for_each(|(seg, view)| seg.copy_from_slice(view.as_bytes()));
    #[cfg(not(feature = "rayon"))]
    segments
        .into_iter()
        .zip(sources)
        .for_each(|(seg, view)| seg.copy_from_slice(view.as_bytes()));
    Ok(())
}

/// Copy each field extent back into its local view.
fn unpack_field_major(buf: &[u8], plan: &TransferPlan, views: Vec<&mut FieldView<'_>>) {
    let copy = |(k, view): (usize, &mut FieldView<'_>)| {
        let range = plan.field(k).range();
        if let Some(dst) = view.as_bytes_mut() {
            dst.copy_from_slice(&buf[range]);
        }
    };
    #[cfg(feature = "rayon")]
    views.into_par_iter().enumerate().for_each(copy);
    #[cfg(not(feature = "rayon"))]
    views.into_iter().enumerate().for_each(copy);
}

/// Fill the `(peer, k)` blocks of `buf` from `source`, one element per local
/// slot of each peer, in local-slot order.
fn pack_peer_major(
    buf: &mut [u8],
    plan: &TransferPlan,
    k: usize,
    index: &PartitionIndex,
    source: &FieldView<'_>,
) {
    let w = plan.row_width(k);
    if w == 0 {
        return;
    }
    let src = source.as_bytes();
    for peer in 0..index.nb_partitions() {
        let Some(range) = plan.segment(peer, k) else {
            continue;
        };
        let globals = index.globals_of(peer);
        let copy = |(out, &g): (&mut [u8], &usize)| out.copy_from_slice(&src[g * w..(g + 1) * w]);
        #[cfg(feature = "rayon")]
        buf[range]
            .par_chunks_exact_mut(w)
            .zip(globals.par_iter())
            .for_each(copy);
        #[cfg(not(feature = "rayon"))]
        buf[range]
            .chunks_exact_mut(w)
            .zip(globals.iter())
            .for_each(copy);
    }
}

/// Fill every element `g` of `view` from slot `location_of(g).local` of the
/// `(location_of(g).rank, k)` block.
fn unpack_peer_major(
    buf: &[u8],
    plan: &TransferPlan,
    k: usize,
    index: &PartitionIndex,
    view: &mut FieldView<'_>,
) {
    let w = plan.row_width(k);
    if w == 0 {
        return;
    }
    let starts: Vec<Option<usize>> = (0..index.nb_partitions())
        .map(|peer| plan.segment(peer, k).map(|r| r.start))
        .collect();
    let Some(dst) = view.as_bytes_mut() else {
        return;
    };
    let copy = |(g, out): (usize, &mut [u8])| {
        if let Some(loc) = index.location_of(g) {
            if let Some(Some(start)) = starts.get(loc.rank) {
                let at = start + loc.local * w;
                out.copy_from_slice(&buf[at..at + w]);
            }
        }
    };
    #[cfg(feature = "rayon")]
    dst.par_chunks_exact_mut(w).enumerate().for_each(copy);
    #[cfg(not(feature = "rayon"))]
    dst.chunks_exact_mut(w).enumerate().for_each(copy);
}
