//! Bulk uploads through the S3 Browser application
//! (<https://s3browser.com/>).

use std::process::Command;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use super::BulkStore;

pub struct S3BrowserStore {
    account: String,
    /// Bucket plus any working directory inside it.
    s3_dir: Utf8PathBuf,
}

impl S3BrowserStore {
    pub fn new(account: &str, bucket: &str, s3_dir: Option<Utf8PathBuf>) -> Self {
        let mut dir = Utf8PathBuf::from(bucket);
        if let Some(s3_dir) = s3_dir {
            dir.push(s3_dir);
        }
        Self {
            account: account.to_owned(),
            s3_dir: dir,
        }
    }
}

impl BulkStore for S3BrowserStore {
    fn describe(&self) -> String {
        format!("S3 Browser ({}@{})", self.account, self.s3_dir)
    }

    fn upload(&self, local_path: &Utf8Path) -> Result<()> {
        let probe = Command::new("s3browser-cli")
            .args(["license", "show"])
            .output()
            .context(
                "S3 Browser is not available; \
                 please make sure s3browser-cli is on the path",
            )?;
        ensure!(
            probe.status.success(),
            "s3browser-cli license show failed: {}",
            String::from_utf8_lossy(&probe.stderr)
        );

        info!("Uploading {local_path} via S3 Browser");
        let status = Command::new("s3browser-cli")
            .args(["file", "upload"])
            .arg(&self.account)
            .arg(format!("{local_path}/*"))
            .arg(self.s3_dir.as_str())
            .status()
            .context("Couldn't run s3browser-cli file upload")?;
        if !status.success() {
            bail!("s3browser-cli upload failed with {status}");
        }
        Ok(())
    }
}
