//! Overlapping host work with the non-bonded offload.
//!
//! Builds a small periodic box of charged LJ particles split into a local and
//! a non-local partition, then runs a few MD-like steps: each step launches
//! the device work, does a stand-in for the host-side bonded forces while the
//! streams run, and waits for the results. Timing is printed as JSON at the end.
//!
//! Usage:
//! ```bash
//! cargo run --release --example two_stream_step -- [config.toml]
//! ```

use anyhow::{Context, Result};
use prism_core::{ElectrostaticsModel, Float3, NonbondedConfig};
use prism_nb::{AtomSystem, LjPair, LjParameters, NoExclusions, NonbondedPipeline};
use std::env;
use std::sync::Arc;
use std::time::Instant;

const N_SIDE: usize = 12;
const SPACING: f32 = 0.31;
const STEPS: usize = 20;

fn build_system() -> AtomSystem {
    let mut positions = Vec::with_capacity(N_SIDE.pow(3));
    let mut charges = Vec::with_capacity(N_SIDE.pow(3));
    for ix in 0..N_SIDE {
        for iy in 0..N_SIDE {
            for iz in 0..N_SIDE {
                positions.push(Float3::new(
                    (ix as f32 + 0.5) * SPACING,
                    (iy as f32 + 0.5) * SPACING,
                    (iz as f32 + 0.5) * SPACING,
                ));
                charges.push(if (ix + iy + iz) % 2 == 0 { 0.5 } else { -0.5 });
            }
        }
    }
    let natoms = positions.len();
    AtomSystem::new(positions, charges, vec![0; natoms])
        .with_box(Float3::splat(N_SIDE as f32 * SPACING))
        .with_n_local(natoms * 2 / 3)
}

/// Stand-in for the bonded force evaluation done on the host.
fn host_bonded_work(system: &AtomSystem) -> f64 {
    system
        .positions
        .windows(2)
        .map(|w| (w[1] - w[0]).norm_sq() as f64)
        .sum()
}

fn main() -> Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => NonbondedConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => NonbondedConfig::builder()
            .cutoffs(1.0, 1.0)
            .list_buffer(0.1)
            .prune_buffer(0.02)
            .electrostatics(ElectrostaticsModel::Ewald)
            .rebuild_interval(10)
            .prune_delay(2)
            .timing(true)
            .build()?,
    };
    config.validate()?;

    let lj = LjParameters::geometric(&[LjPair::from_sigma_epsilon(0.3166, 0.65)])?;
    let mut pipeline = NonbondedPipeline::new(config, lj, Arc::new(NoExclusions))?;
    let mut system = build_system();

    println!(
        "{} atoms ({} local), {} electrostatics",
        system.natoms(),
        system.n_local,
        pipeline.config().electrostatics.model
    );

    let started = Instant::now();
    for step in 0..STEPS {
        let compute_energy = step % 5 == 0;
        pipeline.launch_step(&system, compute_energy)?;
        let bonded = host_bonded_work(&system);
        let results = pipeline.wait_step()?;

        if compute_energy {
            println!(
                "step {:3}: E_lj = {:12.4}  E_el = {:12.4}  (host work {:.3})",
                step, results.energy_lj, results.energy_el, bonded
            );
        }

        // crude steepest-descent move so the lists age against moving atoms
        for (x, f) in system.positions.iter_mut().zip(&results.forces) {
            *x += *f * 1e-6;
        }
    }

    let stats = pipeline.stats();
    println!(
        "\n{} steps in {:.1} ms: {} rebuilds, {} prunes, {} kernel launches",
        stats.steps,
        started.elapsed().as_secs_f64() * 1e3,
        stats.list_rebuilds,
        stats.list_prunes,
        stats.kernel_launches
    );
    println!("{}", pipeline.timing_summary().to_json()?);
    Ok(())
}
