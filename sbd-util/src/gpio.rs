//! Output lines on top of the legacy Linux sysfs GPIO interface.

use color_eyre::eyre::{Context, Result};
use orb_sbd::OutputLine;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

const SYSFS_GPIO: &str = "/sys/class/gpio";

#[derive(Debug)]
pub struct SysfsGpio {
    value: PathBuf,
}

impl SysfsGpio {
    /// Exports GPIO `number` if needed and configures it as an output.
    pub fn output(number: u32) -> Result<Self> {
        let dir = PathBuf::from(format!("{SYSFS_GPIO}/gpio{number}"));
        if !dir.exists() {
            debug!(number, "exporting gpio");
            fs::write(format!("{SYSFS_GPIO}/export"), number.to_string())
                .wrap_err_with(|| format!("failed to export gpio {number}"))?;
        }
        fs::write(dir.join("direction"), "out")
            .wrap_err_with(|| format!("failed to configure gpio {number} as output"))?;

        Ok(Self {
            value: dir.join("value"),
        })
    }
}

impl OutputLine for SysfsGpio {
    fn set(&mut self, high: bool) -> io::Result<()> {
        fs::write(&self.value, if high { "1" } else { "0" })
    }
}
