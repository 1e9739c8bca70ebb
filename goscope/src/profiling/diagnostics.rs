use anyhow::{Context, Result};
use aya::maps::PerCpuArray;
use aya::Ebpf;
use goscope_common::LossReason;

/// Discarded probe firings, summed over all CPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossTotals {
    counts: [u64; LossReason::COUNT as usize],
}

impl LossTotals {
    #[must_use]
    pub fn get(&self, reason: LossReason) -> u64 {
        self.counts[reason.index() as usize]
    }

    pub fn add(&mut self, reason: LossReason, count: u64) {
        let slot = &mut self.counts[reason.index() as usize];
        *slot = slot.saturating_add(count);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Non-zero reasons only
    pub fn iter(&self) -> impl Iterator<Item = (LossReason, u64)> + '_ {
        LossReason::ALL.iter().map(|reason| (*reason, self.get(*reason))).filter(|(_, n)| *n > 0)
    }
}

/// Read the per-CPU `LOSSES` counters
///
/// # Errors
/// Returns an error if the `LOSSES` map cannot be accessed
pub fn read_loss_totals(bpf: &Ebpf) -> Result<LossTotals> {
    let losses: PerCpuArray<_, u64> =
        PerCpuArray::try_from(bpf.map("LOSSES").context("LOSSES map not found")?)?;

    let mut totals = LossTotals::default();
    for reason in LossReason::ALL {
        let per_cpu = losses.get(&reason.index(), 0)?;
        totals.add(reason, per_cpu.iter().sum());
    }
    Ok(totals)
}

/// Print why probe firings produced no event
///
/// # Errors
/// Returns an error if the `LOSSES` map cannot be accessed
pub fn print_loss_diagnostics(bpf: &Ebpf) -> Result<LossTotals> {
    let totals = read_loss_totals(bpf)?;
    if totals.total() == 0 {
        println!("dropped in kernel: 0");
        return Ok(totals);
    }

    println!("dropped in kernel: {}", totals.total());
    for (reason, count) in totals.iter() {
        println!("   - {}: {count}", reason.name());
    }
    Ok(totals)
}
