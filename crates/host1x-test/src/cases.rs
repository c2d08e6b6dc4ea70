//! The test catalogue.
//!
//! Each case opens its own channel, so a failing case cannot leave state
//! behind for the next one.

use std::os::fd::AsFd;

use anyhow::{bail, ensure, Context, Result};
use host1x::{
    wait_fence_fd, Channel, Device, Error, Fence, GemBuffer, PlatformProfile, Submit, SubmitFlags,
    SubmitQuirks, Timeout,
};
use host1x_uapi::opcode;
use tracing::debug;

use crate::perf;

/// What a case runs against.
pub struct Harness<'d> {
    pub device: &'d dyn Device,
    pub profile: PlatformProfile,
}

impl<'d> Harness<'d> {
    /// Channel for the profile's default class plus its syncpoint.
    pub fn open(&self) -> Result<(Channel<'d, dyn Device + 'd>, u32)> {
        let channel = Channel::open_default(self.device, &self.profile)?;
        let syncpt = channel.syncpoint(0)?;
        debug!(context = channel.context(), syncpt, "test channel ready");
        Ok((channel, syncpt))
    }

    /// A job declaring `declared` increments of `syncpt` whose stream performs `embedded`.
    pub fn incr_job(&self, syncpt: u32, declared: u32, embedded: u32) -> Submit {
        let mut submit = Submit::new();
        if embedded > 0 {
            submit.push(opcode::nonincr(opcode::INCR_SYNCPT_OFFSET, embedded));
            submit.extend((0..embedded).map(|_| self.profile.incr_syncpt_op(syncpt)));
        }
        submit.add_incr(syncpt, declared);
        submit
    }
}

pub type CaseFn = fn(&Harness<'_>, &mut Vec<String>) -> Result<()>;

pub struct Case {
    pub name: &'static str,
    pub run: CaseFn,
}

pub const PERF_CASE: &str = "submit_performance";

pub const CASES: &[Case] = &[
    Case {
        name: "submit_wait",
        run: submit_wait,
    },
    Case {
        name: "submit_timeout",
        run: submit_timeout,
    },
    Case {
        name: "invalid_cmdbuf",
        run: invalid_cmdbuf,
    },
    Case {
        name: "invalid_reloc",
        run: invalid_reloc,
    },
    Case {
        name: "fence_fd",
        run: fence_fd,
    },
    Case {
        name: PERF_CASE,
        run: perf::run,
    },
];

/// Cases whose name contains any filter (all when there are none).
pub fn select<'a>(filters: &[String], skip_perf: bool) -> Vec<&'a Case> {
    CASES
        .iter()
        .filter(|case| !(skip_perf && case.name == PERF_CASE))
        .filter(|case| filters.is_empty() || filters.iter().any(|f| case.name.contains(f.as_str())))
        .collect()
}

fn submit_wait(h: &Harness<'_>, _notes: &mut Vec<String>) -> Result<()> {
    let (ch, syncpt) = h.open()?;
    let result = h.incr_job(syncpt, 1, 1).submit(&ch)?;
    result
        .wait(h.device, Timeout::from_millis(1000))
        .context("wait for the submitted job")?;
    Ok(())
}

fn submit_timeout(h: &Harness<'_>, _notes: &mut Vec<String>) -> Result<()> {
    let (ch, syncpt) = h.open()?;
    let result = h.incr_job(syncpt, 2, 1).submit(&ch)?;

    match result.wait(h.device, Timeout::from_millis(100)) {
        Ok(()) => bail!("wait did not time out"),
        Err(err) if err.is_timeout() => {}
        Err(err) => return Err(err).context("wait for the short job"),
    }

    // Let the job timeout handler finish it so later cases start clean.
    result
        .wait(h.device, Timeout::Never)
        .context("drain the short job")?;
    Ok(())
}

fn expect_rejected(attempt: host1x::Result<host1x::SubmitResult>, what: &str) -> Result<()> {
    match attempt {
        Ok(_) => bail!("submit with {what} did not return an error"),
        Err(Error::Submit(_)) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("submit with {what} failed early")),
    }
}

fn invalid_cmdbuf(h: &Harness<'_>, _notes: &mut Vec<String>) -> Result<()> {
    let (ch, syncpt) = h.open()?;

    let quirked = |quirks: SubmitQuirks| {
        let mut submit = Submit::with_quirks(quirks);
        submit.extend(h.incr_job(syncpt, 1, 1).words().iter().copied());
        submit.add_incr(syncpt, 1);
        submit
    };

    let oversized = quirked(SubmitQuirks {
        force_cmdbuf_words: Some(10_000),
        ..Default::default()
    });
    expect_rejected(oversized.submit(&ch), "an oversized word count")?;

    let misaligned = quirked(SubmitQuirks {
        force_cmdbuf_offset: Some(1),
        ..Default::default()
    });
    expect_rejected(misaligned.submit(&ch), "a misaligned command buffer offset")?;
    Ok(())
}

fn invalid_reloc(h: &Harness<'_>, _notes: &mut Vec<String>) -> Result<()> {
    let (ch, syncpt) = h.open()?;
    let target = GemBuffer::allocate(h.device, 128)?;

    let cases = [
        (8192, 0, "a relocation past the command buffer"),
        (1, 0, "a misaligned relocation"),
        (4, 8192, "a relocation target past its buffer"),
    ];
    for (cmdbuf_offset, target_offset, what) in cases {
        let mut submit = h.incr_job(syncpt, 1, 1);
        submit.add_reloc(cmdbuf_offset, target.handle(), target_offset, 0);
        expect_rejected(submit.submit(&ch), what)?;
    }
    Ok(())
}

fn fence_fd(h: &Harness<'_>, _notes: &mut Vec<String>) -> Result<()> {
    let (ch, syncpt) = h.open()?;
    let mut submit = h.incr_job(syncpt, 1, 1);
    submit.set_flags(SubmitFlags::SYNC_FILE);
    let result = submit.submit(&ch)?;

    let Fence::SyncFile(fd) = &result.fence else {
        bail!("driver returned a threshold instead of a sync file");
    };
    wait_fence_fd(fd.as_fd(), Timeout::from_millis(1000)).context("wait for the sync file")?;
    ensure!(result.threshold().is_none(), "sync-file fence reported a threshold");
    Ok(())
}
