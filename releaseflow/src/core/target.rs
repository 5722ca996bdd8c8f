//! Build targets: operating system and CPU architecture pairs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An operating system a native library is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux (ELF shared objects).
    Linux,
    /// macOS (Mach-O dylibs, universal binaries supported).
    Macos,
    /// Windows (DLLs).
    Windows,
}

impl Os {
    /// All known operating systems.
    pub const ALL: [Self; 3] = [Self::Linux, Self::Macos, Self::Windows];

    /// Returns the platform tag used in artifact keys.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Windows => "windows",
        }
    }

    /// File name of the dynamic library for `lib_name` on this OS.
    #[must_use]
    pub fn dynamic_lib_file(&self, lib_name: &str) -> String {
        match self {
            Self::Linux => format!("lib{lib_name}.so"),
            Self::Macos => format!("lib{lib_name}.dylib"),
            Self::Windows => format!("{lib_name}.dll"),
        }
    }

    /// File name of the static library for `lib_name` on this OS.
    #[must_use]
    pub fn static_lib_file(&self, lib_name: &str) -> String {
        match self {
            Self::Linux | Self::Macos => format!("lib{lib_name}.a"),
            Self::Windows => format!("{lib_name}.lib"),
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Os {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "macos" | "darwin" | "osx" => Ok(Self::Macos),
            "windows" | "win" => Ok(Self::Windows),
            other => Err(format!("unknown operating system '{other}'")),
        }
    }
}

/// A CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86.
    #[serde(rename = "x86_64")]
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

impl Arch {
    /// Returns the canonical architecture name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Suffix appended to artifact keys for this architecture.
    #[must_use]
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Self::X86_64 => "",
            Self::Aarch64 => "-arm",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}

/// One native-build unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// The operating system.
    pub os: Os,
    /// The CPU architecture.
    pub arch: Arch,
}

impl Target {
    /// Creates a new target.
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Platform tag used as the dynamic library key, e.g. `linux-arm`.
    #[must_use]
    pub fn platform_tag(&self) -> String {
        format!("{}{}", self.os.tag(), self.arch.key_suffix())
    }

    /// Slug used in stage names, e.g. `macos-aarch64`.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('/')
            .ok_or_else(|| format!("target '{s}' must look like <os>/<arch>"))?;
        Ok(Self::new(os.parse()?, arch.parse()?))
    }
}

/// What platform an artifact was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Platform {
    /// Built for exactly one target.
    Target {
        /// The target.
        target: Target,
    },
    /// A universal artifact covering every architecture of one OS.
    Universal {
        /// The operating system.
        os: Os,
    },
    /// Platform-independent (headers, packages, archives).
    Shared,
}

impl Platform {
    /// Returns the operating system, if the artifact has one.
    #[must_use]
    pub fn os(&self) -> Option<Os> {
        match self {
            Self::Target { target } => Some(target.os),
            Self::Universal { os } => Some(*os),
            Self::Shared => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target { target } => write!(f, "{target}"),
            Self::Universal { os } => write!(f, "{os}/universal"),
            Self::Shared => write!(f, "shared"),
        }
    }
}
