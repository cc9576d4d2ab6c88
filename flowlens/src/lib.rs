pub mod classifier;
pub mod clock;
#[cfg(feature = "kernel")]
pub mod loader;
pub mod node;
pub mod parser;
pub mod ports;
pub mod report;
pub mod table;

pub use classifier::{ClassifierStats, FlowClassifier, OutcomeCounts, Verdict};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use flowlens_common::{FlowInfo, FlowKey, Outcome, Protocol};
pub use ports::{MonitoredPortSet, PortSetError};
pub use table::{FlowTable, Update};
