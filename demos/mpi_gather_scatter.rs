// Gathers a two-field, block-distributed dataset to rank 0 over MPI, checks
// the canonical order, scatters it back and refreshes a one-entry halo
// between neighbouring ranks. Run with e.g. `mpirun -n 3`.
use meshcomm::prelude::*;

fn main() -> Result<(), ExchangeError> {
    let comm = MpiComm::new()?;
    let (me, size) = (comm.rank(), comm.size());
    let n = 5 * size + 2;
    let index = PartitionIndex::from_distribution(&BlockDistribution::new(n, size))?;
    let engine = GatherScatter::new(&index);

    let pressure: Vec<f64> = index.globals_of(me).iter().map(|&g| g as f64 * 0.25).collect();
    let cell_ids: Vec<u32> = index.globals_of(me).iter().map(|&g| g as u32).collect();

    let mut g_pressure = if me == 0 { vec![0f64; n] } else { Vec::new() };
    let mut g_ids = if me == 0 { vec![0u32; n] } else { Vec::new() };
    let stats = engine.gather(
        &comm,
        &mut [FieldView::from_slice(&pressure, 0), FieldView::from_slice(&cell_ids, 0)],
        &mut [
            FieldView::from_slice_mut(&mut g_pressure, 0),
            FieldView::from_slice_mut(&mut g_ids, 0),
        ],
    )?;
    if me == 0 {
        assert!(g_ids.iter().enumerate().all(|(g, &id)| id as usize == g));
        println!("rank 0 gathered {n} points: {stats:?}");
    }

    let mut back = vec![0f64; pressure.len()];
    engine.scatter(
        &comm,
        &mut [FieldView::from_slice(&g_pressure, 0)],
        &mut [FieldView::from_slice_mut(&mut back, 0)],
    )?;
    assert_eq!(back, pressure);

    // mirror the first point of the next rank
    let ghosts: Vec<(usize, usize)> = index
        .globals_of(me)
        .last()
        .filter(|&&g| g + 1 < n)
        .map(|&g| (pressure.len(), g + 1))
        .into_iter()
        .collect();
    let halo = HaloExchange::from_ghosts(&comm, &index, &ghosts, HALO_SETUP_TAGS)?;
    let mut with_halo = pressure.clone();
    with_halo.resize(pressure.len() + ghosts.len(), f64::NAN);
    halo.execute(&comm, &mut FieldView::from_slice_mut(&mut with_halo, 0), 1)?;
    println!("rank {me} halo: {:?}", &with_halo[pressure.len()..]);
    Ok(())
}
