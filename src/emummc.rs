//! Parsing of the emulated-eMMC configuration file stored on the SD card

use anyhow::{ensure, Context};

/// Path of the configuration file, relative to the SD root.
pub const EMUMMC_CONFIG_PATH: &str = "emuMMC/emummc.ini";

/// The `[emummc]` section of the configuration file.
///
/// Only sector-based emulation carries a non-zero `sector`; file-based setups
/// leave it at zero and point `path` at a directory of split images instead.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmummcConfig {
    pub enabled: bool,
    /// Base sector of the raw image on the host medium; 0 for file-based
    pub sector: u64,
    pub path: String,
    pub nintendo_path: String,
}

impl EmummcConfig {
    pub fn sector_based(&self) -> bool {
        self.sector != 0
    }
}

/// Parse the ini text of an emummc configuration file.
///
/// Unknown keys and sections are ignored so newer bootloaders can extend the
/// file without breaking us.
pub fn parse(text: &str) -> anyhow::Result<EmummcConfig> {
    let mut config = EmummcConfig::default();
    let mut in_section = false;
    let mut seen_section = false;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.eq_ignore_ascii_case("emummc");
            seen_section |= in_section;
            continue;
        }
        if !in_section {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("malformed line {} in emummc config", lineno + 1))?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "enabled" => config.enabled = value != "0",
            "sector" => {
                config.sector = parse_number(value)
                    .with_context(|| format!("bad sector value {value:?}"))?
            }
            "path" => config.path = value.to_string(),
            "nintendo_path" => config.nintendo_path = value.to_string(),
            _ => {}
        }
    }

    ensure!(seen_section, "no [emummc] section in config");
    Ok(config)
}

fn parse_number(value: &str) -> anyhow::Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(parsed)
}
