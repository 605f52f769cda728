pub mod address;
pub mod frames;

pub use address::{ProtocolError, WalletAddress, validate_hub_id};
pub use frames::{AccessStatus, HubAccessClientFrame, HubAccessServerFrame};
