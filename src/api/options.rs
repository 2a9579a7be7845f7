use crate::api::types::{OnCongestion, Protocol, ReadBalancing};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables of one mirrored device. Unset fields take the defaults below.
#[derive(Clone)]
pub struct MirrorOptions {
    pub protocol: Protocol,
    pub read_balancing: ReadBalancing,
    pub on_congestion: OnCongestion,
    /// Per-send timeout; also the base of the ack watchdog.
    pub timeout: Option<Duration>,
    /// How long a ping may go unanswered.
    pub ping_timeout: Option<Duration>,
    /// The watchdog declares the peer dead after `ko_count * timeout`.
    pub ko_count: Option<u32>,
    /// Local-disk watchdog; None disables it.
    pub disk_timeout: Option<Duration>,
    /// Epochs are closed once they carry this many writes.
    pub max_epoch_size: Option<u32>,
    /// Transfer-log ring slots.
    pub tl_size: Option<usize>,
    pub max_bio_size: Option<u32>,
    /// log2 of the resync block size (9..=12).
    pub ln2_block_size: Option<u32>,
    /// Congestion threshold in in-flight sectors; 0 disables.
    pub cong_fill: Option<u64>,
    /// Congestion threshold in active activity-log extents.
    pub cong_extents: Option<usize>,
    /// Resync blocks allowed in flight.
    pub sync_window: Option<u32>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            protocol: Protocol::C,
            read_balancing: ReadBalancing::PreferLocal,
            on_congestion: OnCongestion::Block,
            timeout: None,
            ping_timeout: None,
            ko_count: None,
            disk_timeout: None,
            max_epoch_size: None,
            tl_size: None,
            max_bio_size: None,
            ln2_block_size: None,
            cong_fill: None,
            cong_extents: None,
            sync_window: None,
        }
    }
}

pub(crate) struct MirrorOptionsValidated {
    pub protocol: Protocol,
    pub read_balancing: ReadBalancing,
    pub on_congestion: OnCongestion,
    pub timeout: Duration,
    pub ping_timeout: Duration,
    pub ko_count: u32,
    pub disk_timeout: Option<Duration>,
    pub max_epoch_size: u32,
    pub tl_size: usize,
    pub max_bio_size: u32,
    pub ln2_block_size: u32,
    pub cong_fill: u64,
    pub cong_extents: usize,
    pub sync_window: u32,
}

impl MirrorOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero");
        }
        if self.ko_count == 0 {
            return Err("ko-count must be at least 1");
        }
        if !(9..=12).contains(&self.ln2_block_size) {
            return Err("ln2-block-size must be between 9 (512 B) and 12 (4 KiB)");
        }
        if self.max_bio_size == 0 || self.max_bio_size % 512 != 0 {
            return Err("max-bio-size must be a non-zero multiple of 512");
        }
        if self.max_bio_size > 32 * 1024 {
            return Err("max-bio-size must fit a single frame (at most 32 KiB)");
        }
        if self.tl_size < 2 {
            return Err("transfer log needs at least 2 slots");
        }
        if self.max_epoch_size == 0 {
            return Err("max-epoch-size must be at least 1");
        }
        if self.sync_window == 0 {
            return Err("sync-window must be at least 1");
        }
        Ok(())
    }
}

impl TryFrom<MirrorOptions> for MirrorOptionsValidated {
    type Error = &'static str;

    fn try_from(options: MirrorOptions) -> Result<Self, Self::Error> {
        let values = MirrorOptionsValidated {
            protocol: options.protocol,
            read_balancing: options.read_balancing,
            on_congestion: options.on_congestion,
            timeout: options.timeout.unwrap_or(Duration::from_secs(6)),
            ping_timeout: options.ping_timeout.unwrap_or(Duration::from_millis(2000)),
            ko_count: options.ko_count.unwrap_or(7),
            disk_timeout: options.disk_timeout,
            max_epoch_size: options.max_epoch_size.unwrap_or(2048),
            tl_size: options.tl_size.unwrap_or(256),
            max_bio_size: options.max_bio_size.unwrap_or(32 * 1024),
            ln2_block_size: options.ln2_block_size.unwrap_or(12),
            cong_fill: options.cong_fill.unwrap_or(0),
            cong_extents: options.cong_extents.unwrap_or(1237),
            sync_window: options.sync_window.unwrap_or(16),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let validated = MirrorOptionsValidated::try_from(MirrorOptions::default()).unwrap();
        assert_eq!(validated.protocol, Protocol::C);
        assert_eq!(validated.ko_count, 7);
        assert_eq!(validated.ln2_block_size, 12);
    }

    #[test]
    fn rejects_nonsense() {
        let mut options = MirrorOptions::default();
        options.ln2_block_size = Some(13);
        assert!(MirrorOptionsValidated::try_from(options).is_err());

        let mut options = MirrorOptions::default();
        options.max_bio_size = Some(48 * 1024);
        assert!(MirrorOptionsValidated::try_from(options).is_err());

        let mut options = MirrorOptions::default();
        options.tl_size = Some(1);
        assert!(MirrorOptionsValidated::try_from(options).is_err());
    }
}
