use crate::error::{MuxError, Result};
use std::time::Duration;

/// Configuration for a chanmux session.
///
/// `Config` holds the tunables shared by the client and server roles: the
/// largest frame the codec accepts, the length of generated channel ids, how
/// many messages a stream without a message listener holds on to, and the
/// optional transport keep-alive.
///
/// Sessions validate their configuration when they are created, so an
/// invalid struct literal is rejected there as well as by
/// [`ConfigBuilder::build`].
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use chanmux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.channel_id_len, 12);
/// assert!(!config.enable_keep_alive);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use chanmux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .max_frame_size(64 * 1024)
///     .enable_keep_alive(true)
///     .keep_alive_interval(Duration::from_secs(15))
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on one encoded frame, in bytes, in both directions.
    pub max_frame_size: usize,
    pub channel_id_len: usize,
    /// Messages buffered per stream until its first message listener; later ones are dropped.
    pub max_backlog: usize,
    pub keep_alive_interval: Duration,
    pub enable_keep_alive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024, // 1MB
            channel_id_len: 12,
            max_backlog: 1024,
            keep_alive_interval: Duration::from_secs(30),
            enable_keep_alive: false,
        }
    }
}

impl Config {
    pub const MIN_CHANNEL_ID_LEN: usize = 8;
    pub const MAX_CHANNEL_ID_LEN: usize = 64;

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(MuxError::Config("Max frame size cannot be 0".to_string()));
        }

        if self.max_frame_size > 16 * 1024 * 1024 {
            return Err(MuxError::Config(
                "Max frame size cannot exceed 16MB".to_string(),
            ));
        }

        if !(Self::MIN_CHANNEL_ID_LEN..=Self::MAX_CHANNEL_ID_LEN).contains(&self.channel_id_len) {
            return Err(MuxError::Config(format!(
                "Channel id length must be between {} and {}",
                Self::MIN_CHANNEL_ID_LEN,
                Self::MAX_CHANNEL_ID_LEN
            )));
        }

        if self.max_backlog == 0 {
            return Err(MuxError::Config("Max backlog cannot be 0".to_string()));
        }

        if self.enable_keep_alive && self.keep_alive_interval.is_zero() {
            return Err(MuxError::Config(
                "Keep-alive interval cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from `Config::default()`; `build` validates the result.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn channel_id_len(mut self, len: usize) -> Self {
        self.config.channel_id_len = len;
        self
    }

    pub fn max_backlog(mut self, messages: usize) -> Self {
        self.config.max_backlog = messages;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
