use anyhow::{ensure, Context, Result};
use anyscreen_bridge::{BridgeConfig, DeviceFile};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Contents of the optional `--config` JSON file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub bridge: BridgeConfig,
    pub daemon: DaemonConfig,
}

/// Boundaries and modes the daemon programs through ioctls after opening the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub in_block: usize,
    pub out_block1: usize,
    pub out_block2: usize,
    pub preload: bool,
    pub implicit_ack: bool,
    pub batch_size: Option<usize>,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).context(format!("read config file {}", path.display()))?;
        let config: CliConfig = serde_json::from_slice(&data).context("decode config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bridge.validate().context("bridge config")?;
        let daemon = &self.daemon;
        if daemon.implicit_ack {
            ensure!(
                daemon.out_block1 <= daemon.out_block2,
                "out_block1 {} must not be above out_block2 {}",
                daemon.out_block1,
                daemon.out_block2
            );
        }
        if let Some(blocks) = daemon.batch_size {
            ensure!(
                (1..=self.bridge.max_blocks).contains(&blocks),
                "batch_size {} outside 1..={}",
                blocks,
                self.bridge.max_blocks
            );
        }
        Ok(())
    }
}

impl DaemonConfig {
    /// Program the device. Preload is entered last so it starts from the final boundaries.
    pub fn apply(&self, file: &DeviceFile) -> Result<()> {
        file.set_in_block(self.in_block);
        file.set_out_block1(self.out_block1);
        file.set_out_block2(self.out_block2);
        if let Some(blocks) = self.batch_size {
            file.set_batch_size(blocks).context("set batch size")?;
        }
        if self.implicit_ack {
            file.enable_implicit_ack();
        }
        if self.preload {
            file.enter_preload();
        }
        Ok(())
    }
}
