use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMode {
    pub dry_run: bool,
    pub verbose: bool,
}

/// Binary size units; every step scales by 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl SizeUnit {
    pub fn multiplier(self) -> u64 {
        match self {
            SizeUnit::B => 1,
            SizeUnit::KiB => 1 << 10,
            SizeUnit::MiB => 1 << 20,
            SizeUnit::GiB => 1 << 30,
            SizeUnit::TiB => 1 << 40,
        }
    }
}

impl FromStr for SizeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "b" | "byte" | "bytes" => Ok(SizeUnit::B),
            "k" | "kb" | "kib" => Ok(SizeUnit::KiB),
            "m" | "mb" | "mib" => Ok(SizeUnit::MiB),
            "g" | "gb" | "gib" => Ok(SizeUnit::GiB),
            "t" | "tb" | "tib" => Ok(SizeUnit::TiB),
            _ => Err(format!("invalid size unit {}; expected B, KiB, MiB, GiB or TiB", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSize {
    pub value: u64,
    pub unit: SizeUnit,
}

impl ByteSize {
    pub fn new(value: u64, unit: SizeUnit) -> Self {
        Self { value, unit }
    }

    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.multiplier())
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.value, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeUnit {
    Days,
    Weeks,
    Months,
    Years,
}

impl AgeUnit {
    /// Suffix letter understood by rdiff-backup's time parser.
    pub fn letter(self) -> char {
        match self {
            AgeUnit::Days => 'D',
            AgeUnit::Weeks => 'W',
            AgeUnit::Months => 'M',
            AgeUnit::Years => 'Y',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Age {
    pub value: u32,
    pub unit: AgeUnit,
}

impl Age {
    pub fn new(value: u32, unit: AgeUnit) -> Self {
        Self { value, unit }
    }

    pub fn token(&self) -> String {
        format!("{}{}", self.value, self.unit.letter())
    }
}

/// A password or passphrase. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
