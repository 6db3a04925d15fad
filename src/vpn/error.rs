//! Error taxonomy shared by the refresh pipeline and the process supervisor.

use std::path::PathBuf;

/// Errors surfaced by the subscription, generator, writer and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("subscription fetch failed{}: {reason}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Fetch { status: Option<u16>, reason: String },

    #[error("subscription payload could not be decoded: {0}")]
    Decode(String),

    #[error("unsupported protocol '{protocol}' in profile #{index}")]
    UnsupportedProtocol { protocol: String, index: usize },

    #[error("invalid profile #{index}: {reason}")]
    InvalidProfile { index: usize, reason: String },

    #[error("failed to persist config to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch engine: {0}")]
    ProcessLaunch(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("engine did not exit after forced kill (pid {pid})")]
    Stop { pid: u32 },

    #[error("refresh scheduler is not running")]
    SchedulerClosed,
}

impl VpnError {
    /// Whether the next scheduled or manual refresh may succeed without
    /// operator action. Used by the scheduler to decide how loudly to log.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::Decode(_)
                | Self::UnsupportedProtocol { .. }
                | Self::InvalidProfile { .. }
                | Self::Persist { .. }
        )
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }
}

pub type VpnResult<T> = std::result::Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_mentions_status() {
        let err = VpnError::Fetch {
            status: Some(503),
            reason: "service unavailable".into(),
        };
        assert!(err.to_string().contains("HTTP 503"));

        let err = VpnError::Fetch {
            status: None,
            reason: "timed out".into(),
        };
        assert!(!err.to_string().contains("HTTP"));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn unsupported_protocol_carries_tag_and_index() {
        let err = VpnError::UnsupportedProtocol {
            protocol: "wireguard".into(),
            index: 3,
        };
        assert_eq!(err.to_string(), "unsupported protocol 'wireguard' in profile #3");
    }

    #[test]
    fn recoverable_split() {
        assert!(VpnError::Decode("bad".into()).is_recoverable());
        assert!(VpnError::persist("/x", std::io::Error::other("disk full")).is_recoverable());
        assert!(!VpnError::AlreadyRunning.is_recoverable());
        assert!(!VpnError::ProcessLaunch("missing".into()).is_recoverable());
    }
}
