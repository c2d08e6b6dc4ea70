mod cases;
mod config;
mod perf;

use std::io;

use anyhow::{bail, Context};
use host1x::emu::{EmulatedHost1x, EmulatorConfig};
use host1x::{Device, DrmDevice, PlatformProfile, Soc};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::cases::Harness;
use crate::config::{Backend, Config};

fn resolve_soc(config: &Config) -> Soc {
    if let Some(soc) = config.soc {
        eprintln!("Platform: {soc}");
        return soc;
    }
    match Soc::detect() {
        Ok(Some(soc)) => {
            eprintln!("Platform: {soc}");
            soc
        }
        Ok(None) => {
            eprintln!("Failed to detect platform, defaulting to {}", Soc::FALLBACK);
            Soc::FALLBACK
        }
        Err(err) => {
            warn!(%err, "reading the device tree failed");
            eprintln!("Failed to detect platform, defaulting to {}", Soc::FALLBACK);
            Soc::FALLBACK
        }
    }
}

fn open_device(config: &Config, soc: Soc) -> anyhow::Result<Box<dyn Device>> {
    Ok(match config.backend {
        Backend::Drm => {
            let device = match &config.device {
                Some(path) => DrmDevice::open(path)?,
                None => DrmDevice::open_default()?,
            };
            debug!(path = %device.path().display(), "opened DRM device");
            Box::new(device)
        }
        Backend::Emulated => Box::new(EmulatedHost1x::new(EmulatorConfig::for_soc(soc))),
    })
}

/// OS error code carried anywhere in the chain.
fn os_error(err: &anyhow::Error) -> Option<i32> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<host1x::Error>()
            .and_then(host1x::Error::os_error)
            .or_else(|| cause.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error))
    })
}

fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let selected = cases::select(&config.filters, config.skip_perf);
    if config.list {
        for case in &selected {
            println!("{}", case.name);
        }
        return Ok(());
    }

    let soc = resolve_soc(&config);
    let device = open_device(&config, soc).context("open host1x device")?;
    let harness = Harness {
        device: device.as_ref(),
        profile: PlatformProfile::new(soc),
    };
    debug!(
        backend = ?config.backend,
        soc = %harness.profile.soc(),
        cases = selected.len(),
        "running"
    );

    let mut failed = 0usize;
    for case in &selected {
        eprint!("- {:<40} ", case.name);
        let mut notes = Vec::new();
        match (case.run)(&harness, &mut notes) {
            Ok(()) => eprintln!("PASSED"),
            Err(err) => {
                failed += 1;
                eprintln!("FAILED");
                eprintln!("  Reason: {err:#}");
                if let Some(code) = os_error(&err) {
                    eprintln!("  OS error: {code} ({})", io::Error::from_raw_os_error(code));
                }
            }
        }
        for note in notes {
            eprintln!("{note}");
        }
    }

    if failed > 0 {
        bail!("{failed} of {} tests failed", selected.len());
    }
    Ok(())
}
