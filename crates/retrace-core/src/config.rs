use std::time::Duration;

/// Default values for configuration.
pub mod defaults {
    use std::time::Duration;

    /// The default value for `interface`.
    pub const DEFAULT_INTERFACE: &str = "any";

    /// The default value for `bpf-filter` (no filtering).
    pub const DEFAULT_BPF_FILTER: &str = "";

    /// The default value for `timeout`.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// The default value for `snaplen`.
    pub const DEFAULT_SNAPLEN: i32 = 4800;

    /// The default value for `buffer-size`.
    pub const DEFAULT_BUFFER_SIZE: i32 = 16 * 1024 * 1024;

    /// The default value for `use-listeners`.
    pub const DEFAULT_USE_LISTENERS: bool = true;
}

/// Transport channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// The kernel-side capture filter.
    pub filter: String,
    /// The devices to capture on.
    pub devices: Vec<String>,
    /// The capture poll timeout.
    pub read_timeout: Duration,
    /// The capture truncation length.
    pub snaplen: i32,
    /// The capture ring buffer size.
    pub buffer_size: i32,
    /// Whether to run the dispatch task.
    pub use_listeners: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            filter: String::from(defaults::DEFAULT_BPF_FILTER),
            devices: vec![String::from(defaults::DEFAULT_INTERFACE)],
            read_timeout: defaults::DEFAULT_READ_TIMEOUT,
            snaplen: defaults::DEFAULT_SNAPLEN,
            buffer_size: defaults::DEFAULT_BUFFER_SIZE,
            use_listeners: defaults::DEFAULT_USE_LISTENERS,
        }
    }
}
