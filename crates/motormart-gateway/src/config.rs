use std::time::Duration;

/// Deadlines for the three suspension points of a send: the store call, the
/// live socket write and the push provider call.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub db_timeout: Duration,
    pub write_timeout: Duration,
    pub push_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            db_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(3),
            push_timeout: Duration::from_secs(5),
        }
    }
}
