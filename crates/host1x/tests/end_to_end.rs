mod common;

use std::os::fd::AsFd;
use std::time::Duration;

use host1x::emu::{EmulatedHost1x, EmulatorConfig};
use host1x::{
    read_syncpoint, wait_fence_fd, wait_syncpoint, Channel, Error, Fence, GemBuffer, Host1xClass,
    Soc, Submit, SubmitFlags, Timeout,
};
use host1x_uapi::opcode;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use common::{emulator, incr_job};

#[test]
fn submitted_increment_reaches_the_fence() {
    let emu = emulator(Soc::Tegra210);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();
    let before = read_syncpoint(&emu, syncpt).unwrap();

    let result = incr_job(&profile, syncpt, 1, 1).submit(&ch).unwrap();
    assert_eq!(result.syncpt, Some(syncpt));
    let fence = result.threshold().unwrap();
    assert_eq!(fence, before.wrapping_add(1));

    result.wait(&emu, Timeout::from_millis(1000)).unwrap();
    assert!(read_syncpoint(&emu, syncpt).unwrap() >= fence);
    assert_eq!(emu.stats().jobs_timed_out, 0);
}

#[test]
fn short_job_times_out_then_drains() {
    let emu = emulator(Soc::Tegra124);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();

    let result = incr_job(&profile, syncpt, 2, 1).submit(&ch).unwrap();
    let fence = result.threshold().unwrap();

    let err = result.wait(&emu, Timeout::from_millis(100)).unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    match err {
        Error::WaitTimeout { id, threshold, .. } => {
            assert_eq!(id, syncpt);
            assert_eq!(threshold, fence);
        }
        other => panic!("expected a wait timeout, got {other:?}"),
    }

    let value = wait_syncpoint(&emu, syncpt, fence, Timeout::Never).unwrap();
    assert_eq!(value, fence);
    assert_eq!(emu.stats().jobs_timed_out, 1);
}

#[test]
fn thresholds_accumulate_across_jobs() {
    let emu = emulator(Soc::Tegra210);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();

    let first = incr_job(&profile, syncpt, 3, 3).submit(&ch).unwrap();
    let second = incr_job(&profile, syncpt, 2, 2).submit(&ch).unwrap();
    assert_eq!(second.threshold().unwrap(), first.threshold().unwrap() + 2);

    second.wait(&emu, Timeout::from_millis(1000)).unwrap();
    first.wait(&emu, Timeout::from_millis(0)).unwrap();
}

#[test]
fn sync_file_signals_once_increments_land() {
    let emu = emulator(Soc::Tegra210);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();

    let mut submit = incr_job(&profile, syncpt, 2, 1);
    submit.set_flags(SubmitFlags::SYNC_FILE);
    let result = submit.submit(&ch).unwrap();
    let Fence::SyncFile(fd) = &result.fence else {
        panic!("expected a sync file, got {:?}", result.fence);
    };

    let err = wait_fence_fd(fd.as_fd(), Timeout::from_millis(50)).unwrap_err();
    assert!(matches!(err, Error::FenceTimeout { .. }));

    wait_fence_fd(fd.as_fd(), Timeout::from_millis(5000)).unwrap();
    let fence = emu.submissions().pop().unwrap().fence;
    assert!(read_syncpoint(&emu, syncpt).unwrap() >= fence);
}

#[test]
fn sync_file_of_an_unfinished_job_fails_when_the_device_goes_away() {
    let emu = EmulatedHost1x::new(EmulatorConfig {
        job_timeout: Duration::from_secs(30),
        ..EmulatorConfig::for_soc(Soc::Tegra210)
    });
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();

    let mut submit = incr_job(&profile, syncpt, 2, 1);
    submit.set_flags(SubmitFlags::SYNC_FILE);
    let result = submit.submit(&ch).unwrap();
    let Fence::SyncFile(fd) = &result.fence else {
        panic!("expected a sync file, got {:?}", result.fence);
    };

    drop(ch);
    drop(emu);

    let err = wait_fence_fd(fd.as_fd(), Timeout::from_millis(1000)).unwrap_err();
    assert!(matches!(err, Error::Wait(_)), "unexpected error: {err}");
    assert_eq!(err.os_error(), Some(libc::EPIPE));
}

#[test]
fn relocations_are_patched_before_execution() {
    let emu = emulator(Soc::Tegra210);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();
    let target = GemBuffer::allocate(&emu, 4096).unwrap();

    let mut submit = incr_job(&profile, syncpt, 1, 1);
    let at = submit.words().len() as u32 * 4 + 4;
    submit.push(opcode::nonincr(0x2b, 1));
    submit.push(0xdead_beef);
    submit.add_reloc(at, target.handle(), 0x100, 8);
    submit
        .submit(&ch)
        .unwrap()
        .wait(&emu, Timeout::from_millis(1000))
        .unwrap();

    let record = emu.submissions().pop().unwrap();
    let index = at as usize / 4;
    assert_eq!(record.words[index], 0xdead_beef);
    let expected = ((EmulatedHost1x::iova_of(target.handle()) + 0x100) >> 8) as u32;
    assert_eq!(record.executed[index], expected);
}

#[test]
fn channels_of_one_device_get_distinct_syncpoints() {
    let emu = emulator(Soc::Tegra30);
    let gr2d = Channel::open(&emu, Host1xClass::Gr2d).unwrap();
    let gr3d = Channel::open(&emu, Host1xClass::Gr3d).unwrap();
    let a = gr2d.syncpoint(0).unwrap();
    let b = gr3d.syncpoint(0).unwrap();
    assert_ne!(a, b);
    assert_ne!(gr2d.context(), gr3d.context());
    assert_eq!(emu.stats().syncpoints, 2);
}

#[test]
fn repeated_cycles_release_everything() {
    let emu = emulator(Soc::Tegra186);
    let profile = emu.profile();
    let baseline = emu.stats();

    for _ in 0..20 {
        let ch = Channel::open_default(&emu, &profile).unwrap();
        let syncpt = ch.syncpoint(0).unwrap();
        let mut buffer = GemBuffer::allocate(&emu, 256).unwrap();
        buffer.map().unwrap().fill(0xa5);
        incr_job(&profile, syncpt, 1, 1)
            .submit(&ch)
            .unwrap()
            .wait(&emu, Timeout::from_millis(1000))
            .unwrap();
    }

    let after = emu.stats();
    assert_eq!(after.channels, baseline.channels);
    assert_eq!(after.buffers, baseline.buffers);
    assert_eq!(after.mappings, baseline.mappings);
    assert_eq!(after.syncpoints, baseline.syncpoints);
    assert_eq!(after.bytes_allocated, baseline.bytes_allocated);
    assert_eq!(after.jobs_completed, 20);
}

#[test]
fn extra_declarations_for_the_same_syncpoint_add_up() {
    let emu = emulator(Soc::Tegra210);
    let profile = emu.profile();
    let ch = Channel::open_default(&emu, &profile).unwrap();
    let syncpt = ch.syncpoint(0).unwrap();
    let before = read_syncpoint(&emu, syncpt).unwrap();

    let mut submit = incr_job(&profile, syncpt, 1, 3);
    submit.add_incr(syncpt, 2);
    let result = submit.submit(&ch).unwrap();
    assert_eq!(result.threshold(), Some(before + 3));
    result.wait(&emu, Timeout::from_millis(1000)).unwrap();
}

#[test]
fn foreign_syncpoint_is_rejected() {
    let emu = emulator(Soc::Tegra30);
    let profile = emu.profile();
    let owner = Channel::open(&emu, Host1xClass::Gr2d).unwrap();
    let other = Channel::open(&emu, Host1xClass::Gr3d).unwrap();
    let syncpt = owner.syncpoint(0).unwrap();

    let err = incr_job(&profile, syncpt, 1, 1).submit(&other).unwrap_err();
    assert!(matches!(err, Error::Submit(_)));
    assert_eq!(err.os_error(), Some(libc::EINVAL));
}

#[test]
fn job_without_declarations_is_rejected() {
    let emu = emulator(Soc::Tegra210);
    let ch = Channel::open_default(&emu, &emu.profile()).unwrap();
    let mut submit = Submit::new();
    submit.push(opcode::nonincr(0x2b, 1));
    submit.push(0);
    let err = submit.submit(&ch).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EINVAL));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn command_buffer_preserves_arbitrary_words(extra in proptest::collection::vec(any::<u32>(), 1..64)) {
        let emu = emulator(Soc::Tegra210);
        let profile = emu.profile();
        let ch = Channel::open_default(&emu, &profile).unwrap();
        let syncpt = ch.syncpoint(0).unwrap();

        let mut submit = incr_job(&profile, syncpt, 1, 1);
        submit.extend(extra.iter().copied());
        let expected = submit.words().to_vec();
        submit.submit(&ch).unwrap();

        let record = emu.submissions().pop().unwrap();
        prop_assert_eq!(record.words, expected);
    }
}
