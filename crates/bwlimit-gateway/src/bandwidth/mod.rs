//! Connection registry that installs, removes, and retunes one shaping stage
//! per live connection.

pub mod manager;

pub use manager::{
    BandwidthManager, BulkOutcome, ConnectionInfo, GatewayManager, ShapingStatus, STAGE_NAME,
};
