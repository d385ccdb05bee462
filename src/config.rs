use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

use crate::archive;

#[inline]
fn defvolumesize() -> Byte {
    Byte::from_u64(archive::DEFAULT_ARCHIVE_VOLUME_SIZE)
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Sources sit on an SSD, so parallel reads help.
    #[serde(default)]
    pub ssd: bool,

    #[serde(default = "defvolumesize")]
    pub archive_volume_size: Byte,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ssd: false,
            archive_volume_size: defvolumesize(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "duffel.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
