//! Runtime configuration.

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Light-tier invocations before a region is promoted to the next gear.
pub const GEAR_SWITCH_THRESHOLD: u32 = 1000;

/// Default neighbourhood (in guest bytes, each side) for gear shifts.
pub const GEAR_SHIFT_RANGE: u64 = 64;

/// Guest page size. Always 4K for now.
pub const GUEST_PAGE_SIZE: u64 = 4096;

/// Significant guest virtual address bits on 64-bit guests.
pub const GUEST_ADDR_BITS: u32 = 48;

/// How regions are turned into host code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TranslationMode {
    InterpretOnly,
    LiteTranslateOrFallbackToInterpret,
    HeavyOptimizeOrFallbackToInterpret,
    HeavyOptimizeOrFallbackToLiteTranslator,
    /// Lite translate first, heavy optimize once hot.
    #[default]
    TwoGear,
}

impl TranslationMode {
    pub const ALL: [TranslationMode; 5] = [
        TranslationMode::InterpretOnly,
        TranslationMode::LiteTranslateOrFallbackToInterpret,
        TranslationMode::HeavyOptimizeOrFallbackToInterpret,
        TranslationMode::HeavyOptimizeOrFallbackToLiteTranslator,
        TranslationMode::TwoGear,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TranslationMode::InterpretOnly => "interpret-only",
            TranslationMode::LiteTranslateOrFallbackToInterpret => {
                "lite-translate-or-interpret"
            }
            TranslationMode::HeavyOptimizeOrFallbackToInterpret => {
                "heavy-optimize-or-interpret"
            }
            TranslationMode::HeavyOptimizeOrFallbackToLiteTranslator => {
                "heavy-optimize-or-lite-translate"
            }
            TranslationMode::TwoGear => "two-gear",
        }
    }
}

impl fmt::Display for TranslationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TranslationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| ConfigError::UnknownMode(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized translation mode '{0}'")]
    UnknownMode(String),

    #[error("invalid value '{value}' for {var}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("unsupported guest address width {0} (expected 32 or 48)")]
    UnsupportedAddrBits(u32),
}

pub const ENV_MODE: &str = "XLAT_MODE";
pub const ENV_TRANSLATION_THRESHOLD: &str = "XLAT_TRANSLATION_THRESHOLD";
pub const ENV_GEAR_SWITCH_THRESHOLD: &str = "XLAT_GEAR_SWITCH_THRESHOLD";
pub const ENV_GUEST_ADDR_BITS: &str = "XLAT_GUEST_ADDR_BITS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: TranslationMode,
    /// Interpretations of a region before it is first translated.
    pub translation_threshold: u32,
    pub gear_switch_threshold: u32,
    pub guest_addr_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TranslationMode::default(),
            translation_threshold: 0,
            gear_switch_threshold: GEAR_SWITCH_THRESHOLD,
            guest_addr_bits: GUEST_ADDR_BITS,
        }
    }
}

impl Config {
    /// Defaults overridden by `XLAT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(mode) = lookup(ENV_MODE) {
            config.mode = mode.parse()?;
            tracing::info!(mode = %config.mode, "translation mode set from environment");
        }
        if let Some(v) = lookup(ENV_TRANSLATION_THRESHOLD) {
            config.translation_threshold =
                parse_number(ENV_TRANSLATION_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_GEAR_SWITCH_THRESHOLD) {
            config.gear_switch_threshold =
                parse_number(ENV_GEAR_SWITCH_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_GUEST_ADDR_BITS) {
            config.guest_addr_bits = parse_number(ENV_GUEST_ADDR_BITS, &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.guest_addr_bits {
            32 | 48 => Ok(()),
            bits => Err(ConfigError::UnsupportedAddrBits(bits)),
        }
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}
