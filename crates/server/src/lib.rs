//! The server side of the load balancer: work and request queues, the
//! steal protocol, the rank-ordered sync handshake, idle detection,
//! and the single-threaded event loop tying them to the data store.

mod counters;
mod requestqueue;
mod rules;
mod serve;
mod settings;
mod workqueue;

pub use counters::Counters;
pub use requestqueue::RequestQueue;
pub use rules::RuleEngine;
pub use serve::Server;
pub use settings::{HostmapMode, Settings, SettingsError};
pub use workqueue::{NewWork, WorkQueue, WorkUnit, WorkUnitId};

/// The work type used for notification tasks.
pub const CONTROL_WORK_TYPE: i32 = 1;

/// Notification tasks run ahead of normal work.
pub const CONTROL_PRIORITY: i32 = 1;

/// How many deferred inbound syncs are buffered before further
/// requests are rejected outright.
pub const PENDING_SYNC_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fabric(#[from] fabric::Error),
    #[error(transparent)]
    Protocol(#[from] proto::Error),
    #[error("notification payload is malformed")]
    BadNotification,
    /// Shutdown observed while waiting mid-operation; unwinds to the
    /// event loop.
    #[error("shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The payload of a close-notification task, in the form the worker
/// runtime parses: `close <id>` or `close <id> <subscript>`.
pub fn notification_payload(id: codec::DatumId, subscript: Option<&[u8]>) -> bytes::Bytes {
    let text = match subscript {
        None => format!("close {}", id.0),
        Some(sub) => format!("close {} {}", id.0, String::from_utf8_lossy(sub)),
    };
    bytes::Bytes::from(text)
}

/// Parse a close-notification payload back into its `(id, subscript)`.
pub fn parse_notification(payload: &[u8]) -> Result<(codec::DatumId, Option<Vec<u8>>)> {
    let text = std::str::from_utf8(payload).map_err(|_| Error::BadNotification)?;
    let mut parts = text.splitn(3, ' ');
    if parts.next() != Some("close") {
        return Err(Error::BadNotification);
    }
    let id = parts
        .next()
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or(Error::BadNotification)?;
    let subscript = parts.next().map(|s| s.as_bytes().to_vec());
    Ok((codec::DatumId(id), subscript))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn notification_payload_round_trips() {
        let payload = notification_payload(codec::DatumId(42), None);
        assert_eq!(
            parse_notification(&payload).unwrap(),
            (codec::DatumId(42), None)
        );

        let payload = notification_payload(codec::DatumId(7), Some(b"key x"));
        assert_eq!(
            parse_notification(&payload).unwrap(),
            (codec::DatumId(7), Some(b"key x".to_vec()))
        );
    }

    #[test]
    fn malformed_notifications_are_rejected() {
        assert!(parse_notification(b"open 4").is_err());
        assert!(parse_notification(b"close x").is_err());
        assert!(parse_notification(&[0xff, 0xfe]).is_err());
    }
}
