pub mod bus;
pub mod monitor;

pub use bus::ProgressBus;
pub use monitor::ProgressMonitor;
