//! Submit latency measurement.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use host1x::{wait_syncpoint, GemBuffer, Submit, Timeout};
use host1x_uapi::opcode;
use tracing::info;

use crate::cases::Harness;

/// (batches, submits per batch) pairs measured for every relocation count.
const SHAPES: [(u32, u32); 3] = [(50, 10), (30, 50), (10, 255)];
const MAX_RELOCS: u32 = 22;
const RELOC_STEP: usize = 3;
const RELOC_TARGET_SIZE: u64 = 4096;
/// Register the dummy relocated writes go to.
const SCRATCH_REG: u32 = 0x2b;

#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub batches: u32,
    pub submits: u32,
    pub relocs: u32,
    /// Time spent inside submit calls, waits excluded.
    pub elapsed: Duration,
}

impl Sample {
    pub fn per_batch(&self) -> Duration {
        self.elapsed / self.batches.max(1)
    }

    pub fn per_submit(&self) -> Duration {
        self.per_batch() / self.submits.max(1)
    }
}

/// Job with `relocs` relocated register writes followed by one syncpoint increment.
fn reloc_job(h: &Harness<'_>, syncpt: u32, targets: &[u32]) -> Submit {
    let mut submit = Submit::new();
    for (i, &target) in targets.iter().enumerate() {
        submit.push(opcode::nonincr(SCRATCH_REG, 1));
        submit.push(0xdead_beef);
        submit.add_reloc(i as u32 * 8 + 4, target, 0, 0);
    }
    submit.push(opcode::incr_syncpt_header());
    submit.push(h.profile.incr_syncpt_op(syncpt));
    submit.add_incr(syncpt, 1);
    submit
}

pub fn measure(h: &Harness<'_>, batches: u32, submits: u32, relocs: u32) -> Result<Sample> {
    let (ch, syncpt) = h.open()?;
    let targets = (0..relocs)
        .map(|_| GemBuffer::allocate(h.device, RELOC_TARGET_SIZE))
        .collect::<host1x::Result<Vec<_>>>()?;
    let handles: Vec<u32> = targets.iter().map(GemBuffer::handle).collect();
    let template = reloc_job(h, syncpt, &handles);

    let mut elapsed = Duration::ZERO;
    for _ in 0..batches {
        let begin = Instant::now();
        let mut last = None;
        for _ in 0..submits {
            last = Some(template.clone().submit(&ch)?);
        }
        elapsed += begin.elapsed();

        if let Some(threshold) = last.as_ref().and_then(|r| r.threshold()) {
            wait_syncpoint(h.device, syncpt, threshold, Timeout::Never)
                .context("wait for the batch")?;
        }
    }

    Ok(Sample {
        batches,
        submits,
        relocs,
        elapsed,
    })
}

pub fn run(h: &Harness<'_>, notes: &mut Vec<String>) -> Result<()> {
    let mut total = Duration::ZERO;
    for relocs in (0..MAX_RELOCS).step_by(RELOC_STEP) {
        for (batches, submits) in SHAPES {
            let sample = measure(h, batches, submits, relocs)?;
            info!(batches, submits, relocs, elapsed = ?sample.elapsed, "perf sample");
            notes.push(format!(
                "perf: {:3} batches of {:3} submits of {:3} relocations took {:.6} sec per batch on average, one submit takes {:.3} us",
                sample.batches,
                sample.submits,
                sample.relocs,
                sample.per_batch().as_secs_f64(),
                sample.per_submit().as_secs_f64() * 1e6,
            ));
            total += sample.elapsed;
        }
    }
    notes.push(format!("perf: spent {:.6} sec in total", total.as_secs_f64()));
    Ok(())
}
