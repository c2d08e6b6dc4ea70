//! Command stream interpreter.
//!
//! Only register writes matter to the model: a write to `INCR_SYNCPT`
//! (offset 0 in every class) increments the syncpoint named in the low bits of
//! the value. Everything else is decoded just far enough to skip its payload.

use host1x_uapi::opcode::{self, Opcode, INCR_SYNCPT_OFFSET};

use crate::platform::PlatformProfile;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecFault {
    /// The stream ended inside an opcode's payload.
    Truncated { at: usize },
    /// The model does not execute this opcode (gathers, restarts, stream ids...).
    Unsupported { at: usize, opcode: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Execution {
    /// Syncpoint ids incremented, in stream order.
    pub increments: Vec<u32>,
    /// Why execution stopped early, if it did.
    pub fault: Option<ExecFault>,
}

struct Interpreter<'a> {
    words: &'a [u32],
    profile: &'a PlatformProfile,
    out: Execution,
}

impl Interpreter<'_> {
    fn write_reg(&mut self, offset: u32, value: u32) {
        if offset == INCR_SYNCPT_OFFSET {
            self.out.increments.push(value & self.profile.id_mask());
        }
    }

    /// Writes `count` payload words starting at `at` to `offset` (+k when `incrementing`).
    fn write_run(&mut self, at: usize, offset: u32, count: usize, incrementing: bool) -> Result<(), ExecFault> {
        let payload = self
            .words
            .get(at..at + count)
            .ok_or(ExecFault::Truncated { at })?;
        for (k, &value) in payload.iter().enumerate() {
            let reg = if incrementing { offset + k as u32 } else { offset };
            self.write_reg(reg, value);
        }
        Ok(())
    }

    fn write_masked(&mut self, at: usize, offset: u32, mask: u32) -> Result<usize, ExecFault> {
        let count = mask.count_ones() as usize;
        let payload = self
            .words
            .get(at..at + count)
            .ok_or(ExecFault::Truncated { at })?;
        let regs = (0..16).filter(|bit| mask & (1 << bit) != 0);
        for (bit, &value) in regs.zip(payload) {
            self.write_reg(offset + bit, value);
        }
        Ok(count)
    }

    fn run(mut self) -> Execution {
        let mut pc = 0;
        while pc < self.words.len() {
            let word = self.words[pc];
            let offset = opcode::reg_offset(word);
            let payload = opcode::payload_of(word);
            let next = pc + 1;

            let step = match Opcode::of(word) {
                Some(Opcode::SetClass) => self.write_masked(next, offset, word & 0x3f),
                Some(Opcode::Incr) => self
                    .write_run(next, offset, payload as usize, true)
                    .map(|()| payload as usize),
                Some(Opcode::NonIncr) => self
                    .write_run(next, offset, payload as usize, false)
                    .map(|()| payload as usize),
                Some(Opcode::Mask) => self.write_masked(next, offset, payload),
                Some(Opcode::Imm) => {
                    self.write_reg(offset, payload);
                    Ok(0)
                }
                _ => Err(ExecFault::Unsupported {
                    at: pc,
                    opcode: word >> 28,
                }),
            };

            match step {
                Ok(consumed) => pc = next + consumed,
                Err(fault) => {
                    self.out.fault = Some(fault);
                    break;
                }
            }
        }
        self.out
    }
}

/// Runs `words` and reports the syncpoint increments they perform.
pub fn execute(words: &[u32], profile: &PlatformProfile) -> Execution {
    Interpreter {
        words,
        profile,
        out: Execution::default(),
    }
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Soc;
    use host1x_uapi::opcode::{imm, incr, mask, nonincr, setclass, Host1xClass};
    use pretty_assertions::assert_eq;

    #[test]
    fn nonincr_to_incr_syncpt_increments() {
        let profile = PlatformProfile::new(Soc::Tegra210);
        let words = [nonincr(0, 1), profile.incr_syncpt_op(7)];
        assert_eq!(
            execute(&words, &profile),
            Execution {
                increments: vec![7],
                fault: None
            }
        );
    }

    #[test]
    fn tegra186_layout_decodes_wide_ids() {
        let profile = PlatformProfile::new(Soc::Tegra186);
        let words = [nonincr(0, 2), profile.incr_syncpt_op(300), profile.incr_syncpt_op(301)];
        assert_eq!(execute(&words, &profile).increments, vec![300, 301]);
    }

    #[test]
    fn other_registers_are_skipped() {
        let profile = PlatformProfile::default();
        let words = [
            setclass(Host1xClass::Vic.as_u32(), 0, 0),
            nonincr(0x2b, 1),
            0xdead_beef,
            incr(0x10, 2),
            1,
            2,
            mask(0, 0b11),
            profile.incr_syncpt_op(3),
            0x55,
            imm(0, profile.incr_syncpt_op(4)),
        ];
        let exec = execute(&words, &profile);
        assert_eq!(exec.increments, vec![3, 4]);
        assert_eq!(exec.fault, None);
    }

    #[test]
    fn incrementing_run_only_hits_offset_zero_once() {
        let profile = PlatformProfile::default();
        let words = [incr(0, 3), profile.incr_syncpt_op(1), profile.incr_syncpt_op(2), 0];
        assert_eq!(execute(&words, &profile).increments, vec![1]);
    }

    #[test]
    fn truncated_payload_stops_execution() {
        let profile = PlatformProfile::default();
        let words = [nonincr(0, 1), profile.incr_syncpt_op(1), nonincr(0, 2), profile.incr_syncpt_op(1)];
        let exec = execute(&words, &profile);
        assert_eq!(exec.increments, vec![1]);
        assert_eq!(exec.fault, Some(ExecFault::Truncated { at: 3 }));
    }

    #[test]
    fn gathers_are_unsupported() {
        let profile = PlatformProfile::default();
        let words = [opcode::gather(4), nonincr(0, 1), profile.incr_syncpt_op(1)];
        let exec = execute(&words, &profile);
        assert!(exec.increments.is_empty());
        assert_eq!(exec.fault, Some(ExecFault::Unsupported { at: 0, opcode: 6 }));
    }

    #[test]
    fn gathers_stop_after_earlier_increments() {
        let profile = PlatformProfile::default();
        for gather in [opcode::gather_nonincr(0, 1), opcode::gather_incr(0, 1)] {
            let words = [opcode::incr_syncpt_header(), profile.incr_syncpt_op(2), gather, 0];
            let exec = execute(&words, &profile);
            assert_eq!(exec.increments, vec![2]);
            assert_eq!(exec.fault, Some(ExecFault::Unsupported { at: 2, opcode: 6 }));
        }
    }
}
