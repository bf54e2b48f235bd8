pub mod calibration;
pub mod link;
pub mod server;

pub use calibration::{Calibration, CalibrationError, CALIBRATION_FILE};
pub use link::{Outbound, PeerId, ProtocolLink};
pub use server::NetworkServer;
