//! SoC variants and the per-variant host1x encoding differences.
//!
//! Detection reads the device-tree `compatible` property, a list of
//! NUL-terminated strings. The first string naming a known Tegra generation
//! wins. A missing descriptor or no match is reported as `None`; callers pick
//! an explicit fallback (see [`Soc::FALLBACK`]).

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use host1x_uapi::opcode::Host1xClass;

/// Device-tree root `compatible` property.
pub const DEFAULT_COMPATIBLE_PATH: &str = "/sys/firmware/devicetree/base/compatible";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Soc {
    Tegra20,
    Tegra30,
    Tegra114,
    Tegra124,
    Tegra210,
    Tegra186,
}

impl Soc {
    pub const ALL: [Soc; 6] = [
        Soc::Tegra20,
        Soc::Tegra30,
        Soc::Tegra114,
        Soc::Tegra124,
        Soc::Tegra210,
        Soc::Tegra186,
    ];

    /// Variant assumed when detection finds nothing.
    pub const FALLBACK: Soc = Soc::Tegra210;

    pub const fn compatible(self) -> &'static str {
        match self {
            Soc::Tegra20 => "nvidia,tegra20",
            Soc::Tegra30 => "nvidia,tegra30",
            Soc::Tegra114 => "nvidia,tegra114",
            Soc::Tegra124 => "nvidia,tegra124",
            Soc::Tegra210 => "nvidia,tegra210",
            Soc::Tegra186 => "nvidia,tegra186",
        }
    }

    pub const fn marketing_name(self) -> &'static str {
        match self {
            Soc::Tegra20 => "Tegra 2",
            Soc::Tegra30 => "Tegra 3",
            Soc::Tegra114 => "Tegra 4",
            Soc::Tegra124 => "Tegra K1",
            Soc::Tegra210 => "Tegra X1",
            Soc::Tegra186 => "Tegra X2",
        }
    }

    pub fn from_compatible(s: &str) -> Option<Soc> {
        Soc::ALL.into_iter().find(|soc| soc.compatible() == s)
    }

    /// First known variant named in a NUL-separated `compatible` list.
    pub fn from_compatible_list(bytes: &[u8]) -> Option<Soc> {
        bytes
            .split(|&b| b == 0)
            .filter_map(|entry| std::str::from_utf8(entry).ok())
            .find_map(Soc::from_compatible)
    }

    /// Reads the descriptor at `path`; `Ok(None)` if it is absent or names no known variant.
    pub fn detect_from(path: impl AsRef<Path>) -> io::Result<Option<Soc>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Soc::from_compatible_list(&bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn detect() -> io::Result<Option<Soc>> {
        Soc::detect_from(DEFAULT_COMPATIBLE_PATH)
    }
}

impl fmt::Display for Soc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Soc::Tegra20 => "Tegra20",
            Soc::Tegra30 => "Tegra30",
            Soc::Tegra114 => "Tegra114",
            Soc::Tegra124 => "Tegra124",
            Soc::Tegra210 => "Tegra210",
            Soc::Tegra186 => "Tegra186",
        };
        write!(f, "{name} [{}]", self.marketing_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownSoc(pub String);

impl fmt::Display for UnknownSoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown SoC `{}`", self.0)
    }
}

impl std::error::Error for UnknownSoc {}

impl FromStr for Soc {
    type Err = UnknownSoc;

    /// Accepts `tegra210`, `Tegra210`, `t210` or the full compatible string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let digits = lower
            .strip_prefix("nvidia,")
            .unwrap_or(&lower)
            .trim_start_matches("tegra")
            .trim_start_matches('t');
        let soc = match digits {
            "20" => Soc::Tegra20,
            "30" => Soc::Tegra30,
            "114" => Soc::Tegra114,
            "124" => Soc::Tegra124,
            "210" => Soc::Tegra210,
            "186" => Soc::Tegra186,
            _ => return Err(UnknownSoc(s.to_string())),
        };
        Ok(soc)
    }
}

/// Encoding and class choices for one SoC variant.
///
/// Pass this value explicitly to whatever builds command streams; nothing in
/// this crate keeps a process-wide platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformProfile {
    soc: Soc,
}

impl PlatformProfile {
    pub const fn new(soc: Soc) -> Self {
        Self { soc }
    }

    pub const fn soc(&self) -> Soc {
        self.soc
    }

    /// Bit position of the condition field in an `INCR_SYNCPT` value.
    ///
    /// Tegra186 widened syncpoint ids to 10 bits, pushing the condition up.
    pub const fn cond_shift(&self) -> u32 {
        match self.soc {
            Soc::Tegra20 | Soc::Tegra30 | Soc::Tegra114 | Soc::Tegra124 | Soc::Tegra210 => 8,
            Soc::Tegra186 => 10,
        }
    }

    pub const fn id_mask(&self) -> u32 {
        (1 << self.cond_shift()) - 1
    }

    /// `INCR_SYNCPT` value that increments `syncpt` once the engine is done (`OP_DONE`).
    pub const fn incr_syncpt_op(&self, syncpt: u32) -> u32 {
        syncpt | (1 << self.cond_shift())
    }

    pub const fn default_class(&self) -> Host1xClass {
        match self.soc {
            Soc::Tegra20 | Soc::Tegra30 | Soc::Tegra114 => Host1xClass::Gr2d,
            Soc::Tegra124 | Soc::Tegra210 | Soc::Tegra186 => Host1xClass::Vic,
        }
    }

    /// Number of hardware syncpoints.
    pub const fn syncpoint_count(&self) -> u32 {
        match self.soc {
            Soc::Tegra20 | Soc::Tegra30 | Soc::Tegra114 | Soc::Tegra124 => 32,
            Soc::Tegra210 => 192,
            Soc::Tegra186 => 576,
        }
    }

    /// Engines the Tegra DRM driver exposes as channels on this variant.
    pub fn channel_classes(&self) -> &'static [Host1xClass] {
        match self.soc {
            Soc::Tegra20 | Soc::Tegra30 | Soc::Tegra114 => {
                &[Host1xClass::Gr2d, Host1xClass::Gr2dSb, Host1xClass::Gr3d]
            }
            Soc::Tegra124 | Soc::Tegra210 | Soc::Tegra186 => &[Host1xClass::Vic],
        }
    }
}

impl From<Soc> for PlatformProfile {
    fn from(soc: Soc) -> Self {
        Self::new(soc)
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::new(Soc::FALLBACK)
    }
}
