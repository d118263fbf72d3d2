pub mod backing;
pub mod bitmap;
pub mod device;
pub mod epoch;
pub mod interval;
pub mod metadata;
pub mod request;
pub mod router;
pub mod state;
pub mod timer;
pub mod transfer_log;

pub use device::{ClearMode, Device, DeviceRegistry, PeerDevice, SendWork};
pub use interval::BlockInterval;
pub use request::{Bio, IoKind, IoStatus, RequestEvent, RequestId};
