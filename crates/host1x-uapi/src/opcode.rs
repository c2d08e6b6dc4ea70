//! Host1x command word encoders.
//!
//! Every word in a host1x command stream starts with a 4-bit opcode in bits
//! 31:28. Register writes address the class currently selected on the channel;
//! register offset 0 of every class is `INCR_SYNCPT`.

/// Register offset of `INCR_SYNCPT` in every host1x class.
pub const INCR_SYNCPT_OFFSET: u32 = 0x00;

/// Host1x client classes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Host1xClass {
    Host1x = 0x01,
    Gr2d = 0x51,
    Gr2dSb = 0x52,
    Vic = 0x5d,
    Gr3d = 0x60,
}

impl Host1xClass {
    pub const ALL: [Self; 5] = [Self::Host1x, Self::Gr2d, Self::Gr2dSb, Self::Vic, Self::Gr3d];

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(Self::Host1x),
            0x51 => Some(Self::Gr2d),
            0x52 => Some(Self::Gr2dSb),
            0x5d => Some(Self::Vic),
            0x60 => Some(Self::Gr3d),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Host1x => "host1x",
            Self::Gr2d => "gr2d",
            Self::Gr2dSb => "gr2d-sb",
            Self::Vic => "vic",
            Self::Gr3d => "gr3d",
        }
    }
}

/// Decoded opcode field (bits 31:28).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    SetClass = 0,
    Incr = 1,
    NonIncr = 2,
    Mask = 3,
    Imm = 4,
    Restart = 5,
    Gather = 6,
    SetStrmid = 7,
    SetAppid = 8,
    SetPyld = 9,
    IncrW = 10,
    NonIncrW = 11,
    GatherW = 12,
    RestartW = 13,
    Extend = 14,
}

impl Opcode {
    pub const fn of(word: u32) -> Option<Self> {
        match word >> 28 {
            0 => Some(Self::SetClass),
            1 => Some(Self::Incr),
            2 => Some(Self::NonIncr),
            3 => Some(Self::Mask),
            4 => Some(Self::Imm),
            5 => Some(Self::Restart),
            6 => Some(Self::Gather),
            7 => Some(Self::SetStrmid),
            8 => Some(Self::SetAppid),
            9 => Some(Self::SetPyld),
            10 => Some(Self::IncrW),
            11 => Some(Self::NonIncrW),
            12 => Some(Self::GatherW),
            13 => Some(Self::RestartW),
            14 => Some(Self::Extend),
            _ => None,
        }
    }
}

pub const fn setclass(class_id: u32, offset: u32, mask: u32) -> u32 {
    (offset << 16) | (class_id << 6) | mask
}

pub const fn incr(offset: u32, count: u32) -> u32 {
    (1 << 28) | (offset << 16) | count
}

pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (2 << 28) | (offset << 16) | count
}

pub const fn mask(offset: u32, mask: u32) -> u32 {
    (3 << 28) | (offset << 16) | mask
}

pub const fn imm(offset: u32, value: u32) -> u32 {
    (4 << 28) | (offset << 16) | value
}

pub const fn restart(address: u32) -> u32 {
    (5 << 28) | (address >> 4)
}

pub const fn gather(count: u32) -> u32 {
    (6 << 28) | count
}

pub const fn gather_nonincr(offset: u32, count: u32) -> u32 {
    (6 << 28) | (offset << 16) | (1 << 15) | count
}

pub const fn gather_incr(offset: u32, count: u32) -> u32 {
    (6 << 28) | (offset << 16) | (1 << 15) | (1 << 14) | count
}

/// `NONINCR` to `INCR_SYNCPT`; the next word is the increment directive.
pub const fn incr_syncpt_header() -> u32 {
    nonincr(INCR_SYNCPT_OFFSET, 1)
}

/// Register offset field shared by INCR/NONINCR/MASK/IMM.
pub const fn reg_offset(word: u32) -> u32 {
    (word >> 16) & 0xfff
}

/// Low 16 bits: word count, mask or immediate value depending on the opcode.
pub const fn payload_of(word: u32) -> u32 {
    word & 0xffff
}
