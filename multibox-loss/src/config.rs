//! Configuration file format.

use crate::common::*;

/// The main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub loss: crate::loss::Config,
    /// The device where the loss is computed.
    #[serde(with = "tch_serde::serde_device", default = "default_device")]
    pub device: Device,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = Self::from_json5(&text)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json5(text: &str) -> Result<Self> {
        let config = json5::from_str(text)?;
        Ok(config)
    }
}

fn default_device() -> Device {
    Device::Cpu
}
