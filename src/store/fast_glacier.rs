//! Bulk uploads through the Fast Glacier application
//! (<https://fastglacier.com/>).

use std::process::Command;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use super::BulkStore;

pub struct FastGlacierStore {
    account: String,
    region: String,
    glacier_dir: Utf8PathBuf,
}

impl FastGlacierStore {
    pub fn new(account: &str, region: &str, glacier_dir: Option<Utf8PathBuf>) -> Self {
        Self {
            account: account.to_owned(),
            region: region.to_owned(),
            glacier_dir: glacier_dir.unwrap_or_default(),
        }
    }
}

impl BulkStore for FastGlacierStore {
    fn describe(&self) -> String {
        format!("Fast Glacier ({}@{})", self.account, self.region)
    }

    fn upload(&self, local_path: &Utf8Path) -> Result<()> {
        let probe = Command::new("glacier-con")
            .arg("--version")
            .output()
            .context(
                "Fast Glacier is not available; \
                 please make sure glacier-con is on the path",
            )?;
        ensure!(
            probe.status.success(),
            "glacier-con --version failed: {}",
            String::from_utf8_lossy(&probe.stderr)
        );

        info!("Uploading {local_path} to Fast Glacier");
        let status = Command::new("glacier-con")
            .arg("upload")
            .arg(&self.account)
            .arg(format!("{local_path}/*"))
            .arg(&self.region)
            .arg(self.glacier_dir.as_str())
            .status()
            .context("Couldn't run glacier-con upload")?;
        if !status.success() {
            bail!("glacier-con upload failed with {status}");
        }
        Ok(())
    }
}
