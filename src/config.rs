use std::path::Path;

use anyhow::Context;

use crate::foundation::error::{ProxyError, ProxyResult};
use crate::proxy::cached::CachedProxyOpts;
use crate::remote::PresenterOpts;
use crate::remote::channel::RingOpts;

/// Settings for a remote-producer hand-off session.
///
/// Every field has a default, so `{}` is a valid config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandoffConfig {
    pub cached: CachedProxyOpts,
    pub presenter: PresenterOpts,
    /// Buffers in the producer's ring.
    pub ring_size: usize,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            cached: CachedProxyOpts::default(),
            presenter: PresenterOpts::default(),
            ring_size: 3,
            frame_width: 64,
            frame_height: 64,
        }
    }
}

impl HandoffConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(s: &str) -> ProxyResult<Self> {
        let cfg: Self = serde_json::from_str(s).context("parse handoff config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: &Path) -> ProxyResult<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read handoff config '{}'", path.display()))?;
        Self::from_json_str(&s)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        self.cached.validate()?;
        if self.ring_size == 0 {
            return Err(ProxyError::validation("ring_size must be > 0"));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ProxyError::validation(
                "frame_width/frame_height must be non-zero",
            ));
        }
        Ok(())
    }

    /// Producer ring settings derived from this config.
    pub fn ring_opts(&self) -> RingOpts {
        RingOpts {
            ring_size: self.ring_size,
            width: self.frame_width,
            height: self.frame_height,
            fail_after: None,
        }
    }
}
