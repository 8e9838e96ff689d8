//! Inbound data request types.

use crate::frame::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the readout unit a request is addressed to.
pub type ComponentId = u32;

/// Opaque name of the endpoint that receives a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataDestination(String);

impl DataDestination {
    /// Wrap a destination name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Destination name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataDestination {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Inclusive timestamp window `[window_begin_ts, window_end_ts]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWindow {
    /// First tick of interest.
    pub window_begin_ts: Timestamp,
    /// Last tick of interest.
    pub window_end_ts: Timestamp,
}

impl RequestWindow {
    /// Window from `begin` to `end`.
    pub fn new(window_begin_ts: Timestamp, window_end_ts: Timestamp) -> Self {
        Self {
            window_begin_ts,
            window_end_ts,
        }
    }

    /// False when the begin lies after the end.
    pub fn is_valid(&self) -> bool {
        self.window_begin_ts <= self.window_end_ts
    }
}

/// A request to extract `[begin, end]` from the latency buffer.
///
/// Consumed exactly once by a [`RequestHandler`](crate::request_handler::RequestHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Requested time window.
    pub request_information: RequestWindow,
    /// Trigger that caused the request.
    pub trigger_number: u64,
    /// Target readout unit.
    pub component_id: ComponentId,
    /// Where the fragment must be sent.
    pub data_destination: DataDestination,
}

impl DataRequest {
    /// Build a request for `[begin, end]`.
    pub fn new(
        trigger_number: u64,
        window_begin_ts: Timestamp,
        window_end_ts: Timestamp,
        component_id: ComponentId,
        data_destination: impl Into<DataDestination>,
    ) -> Self {
        Self {
            request_information: RequestWindow::new(window_begin_ts, window_end_ts),
            trigger_number,
            component_id,
            data_destination: data_destination.into(),
        }
    }
}
