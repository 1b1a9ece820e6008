//! kinect-motor: tilt motor control for the Kinect motor/accelerometer USB device.

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod feedback;
pub mod hotplug;
pub mod instance;
pub mod node;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod usb;

pub use driver::{DriverOptions, MotorDriver};
pub use error::MotorError;
pub use node::MotorNode;
pub use protocol::TiltCommand;
pub use transport::UsbTransport;
