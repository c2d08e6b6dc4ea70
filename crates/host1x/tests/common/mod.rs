#![allow(dead_code)]

use std::time::Duration;

use host1x::emu::{EmulatedHost1x, EmulatorConfig};
use host1x::{PlatformProfile, Soc, Submit};
use host1x_uapi::opcode;
use tracing_subscriber::EnvFilter;

/// Routes library logs through the test harness's captured output (`RUST_LOG` to enable).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn emulator(soc: Soc) -> EmulatedHost1x {
    init_tracing();
    EmulatedHost1x::new(EmulatorConfig {
        job_timeout: Duration::from_millis(300),
        ..EmulatorConfig::for_soc(soc)
    })
}

/// A job declaring `declared` increments of `syncpt` whose stream performs `embedded` of them.
pub fn incr_job(profile: &PlatformProfile, syncpt: u32, declared: u32, embedded: u32) -> Submit {
    let mut submit = Submit::new();
    submit.push(opcode::setclass(profile.default_class().as_u32(), 0, 0));
    if embedded > 0 {
        submit.push(opcode::nonincr(opcode::INCR_SYNCPT_OFFSET, embedded));
        submit.extend((0..embedded).map(|_| profile.incr_syncpt_op(syncpt)));
    }
    submit.add_incr(syncpt, declared);
    submit
}
