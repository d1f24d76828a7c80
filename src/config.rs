use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Upper bound for every `*_mib` setting (4 PiB), so byte sums cannot wrap.
pub const MAX_SIZE_MIB: u64 = 1 << 32;

/// Whether a dedicated try-boot partition precedes boot A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutVariant {
    /// Small FAT partition 1 holding only the slot-control descriptor.
    TrybootPartition,
    /// Boot A is partition 1 and carries the slot descriptors itself.
    #[default]
    Compact,
}

impl LayoutVariant {
    pub fn has_tryboot_partition(self) -> bool {
        matches!(self, LayoutVariant::TrybootPartition)
    }
}

/// How boot files and fstab refer to partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootSelector {
    #[default]
    Partuuid,
    Label,
}

/// Size policy, all values in MiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeConfig {
    pub boot_margin_mib: u64,
    pub boot_min_mib: u64,
    pub root_mib: u64,
    pub home_min_mib: u64,
    pub home_floor_mib: u64,
    pub buffer_mib: u64,
    pub tryboot_mib: u64,
    pub image_mib: Option<u64>,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            boot_margin_mib: 64,
            boot_min_mib: 256,
            root_mib: 2500,
            home_min_mib: 256,
            home_floor_mib: 64,
            buffer_mib: 32,
            tryboot_mib: 32,
            image_mib: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub variant: LayoutVariant,
    pub root_selector: RootSelector,
    pub digest: bool,
    pub sizes: SizeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variant: LayoutVariant::default(),
            root_selector: RootSelector::default(),
            digest: true,
            sizes: SizeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    variant: Option<LayoutVariant>,
    root_selector: Option<RootSelector>,
    digest: Option<bool>,
    sizes: Option<SizesToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SizesToml {
    boot_margin_mib: Option<u64>,
    boot_min_mib: Option<u64>,
    root_mib: Option<u64>,
    home_min_mib: Option<u64>,
    home_floor_mib: Option<u64>,
    buffer_mib: Option<u64>,
    tryboot_mib: Option<u64>,
    image_mib: Option<u64>,
}

impl Config {
    /// Load from `path`, or return the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)?;
        let defaults = SizeConfig::default();

        let sizes = match parsed.sizes {
            Some(s) => SizeConfig {
                boot_margin_mib: s.boot_margin_mib.unwrap_or(defaults.boot_margin_mib),
                boot_min_mib: s.boot_min_mib.unwrap_or(defaults.boot_min_mib),
                root_mib: s.root_mib.unwrap_or(defaults.root_mib),
                home_min_mib: s.home_min_mib.unwrap_or(defaults.home_min_mib),
                home_floor_mib: s.home_floor_mib.unwrap_or(defaults.home_floor_mib),
                buffer_mib: s.buffer_mib.unwrap_or(defaults.buffer_mib),
                tryboot_mib: s.tryboot_mib.unwrap_or(defaults.tryboot_mib),
                image_mib: s.image_mib,
            },
            None => defaults,
        };

        let config = Self {
            variant: parsed.variant.unwrap_or_default(),
            root_selector: parsed.root_selector.unwrap_or_default(),
            digest: parsed.digest.unwrap_or(true),
            sizes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sizes;
        for (name, value) in [
            ("boot_min_mib", s.boot_min_mib),
            ("root_mib", s.root_mib),
            ("home_min_mib", s.home_min_mib),
            ("home_floor_mib", s.home_floor_mib),
            ("tryboot_mib", s.tryboot_mib),
        ] {
            if value == 0 {
                bail!("invalid config: {name} must be greater than zero");
            }
        }
        for (name, value) in [
            ("boot_margin_mib", s.boot_margin_mib),
            ("boot_min_mib", s.boot_min_mib),
            ("root_mib", s.root_mib),
            ("home_min_mib", s.home_min_mib),
            ("home_floor_mib", s.home_floor_mib),
            ("buffer_mib", s.buffer_mib),
            ("tryboot_mib", s.tryboot_mib),
            ("image_mib", s.image_mib.unwrap_or(0)),
        ] {
            if value > MAX_SIZE_MIB {
                bail!("invalid config: {name} ({value}) exceeds {MAX_SIZE_MIB} MiB");
            }
        }
        if s.image_mib == Some(0) {
            bail!("invalid config: image_mib must be greater than zero");
        }
        if s.home_floor_mib > s.home_min_mib {
            bail!(
                "invalid config: home_floor_mib ({}) exceeds home_min_mib ({})",
                s.home_floor_mib,
                s.home_min_mib
            );
        }
        // Three logical gaps plus one unit of trailing slack.
        if s.buffer_mib < 4 {
            bail!(
                "invalid config: buffer_mib must be at least 4 (got {})",
                s.buffer_mib
            );
        }
        Ok(())
    }
}
