//! Endpoint configuration.

use crate::buf::BLOCK_PAYLOAD;

/// Smallest queue depth either ring is allowed to have.
pub const MIN_QUEUE_SIZE: u32 = 16;

/// Endpoint configuration.
///
/// The queue depths are derived from the byte budgets: one work request per
/// payload block plus one, floored at [`MIN_QUEUE_SIZE`]. The actual limit
/// is per work request; the byte budgets are a rough recommendation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Send byte budget.
    /// Default: 1 MiB
    pub send_buf_size: usize,
    /// Receive byte budget.
    /// Default: 1 MiB
    pub recv_buf_size: usize,
    /// Cut received blocks into the socket read buffer instead of copying.
    /// Default: true
    pub recv_zerocopy: bool,
    /// Run the shared-CQ completion consumer on a dedicated thread. When
    /// false, completions are handled inline on the dispatcher, which must
    /// then serialize them per endpoint.
    /// Default: true
    pub completion_in_thread: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_buf_size: 1 << 20,
            recv_buf_size: 1 << 20,
            recv_zerocopy: true,
            completion_in_thread: true,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send byte budget.
    pub fn with_send_buf_size(mut self, bytes: usize) -> Self {
        self.send_buf_size = bytes;
        self
    }

    /// Set the receive byte budget.
    pub fn with_recv_buf_size(mut self, bytes: usize) -> Self {
        self.recv_buf_size = bytes;
        self
    }

    /// Enable or disable zero-copy receive.
    pub fn with_recv_zerocopy(mut self, zerocopy: bool) -> Self {
        self.recv_zerocopy = zerocopy;
        self
    }

    /// Choose the execution context of the shared-CQ completion consumer.
    pub fn with_completion_in_thread(mut self, in_thread: bool) -> Self {
        self.completion_in_thread = in_thread;
        self
    }

    /// Send queue depth derived from the send byte budget.
    pub(crate) fn sq_size(&self) -> u32 {
        ((self.send_buf_size / BLOCK_PAYLOAD) as u32 + 1).max(MIN_QUEUE_SIZE)
    }

    /// Receive queue depth derived from the receive byte budget.
    pub(crate) fn rq_size(&self) -> u32 {
        ((self.recv_buf_size / BLOCK_PAYLOAD) as u32 + 1).max(MIN_QUEUE_SIZE)
    }
}
