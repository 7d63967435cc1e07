//! ipwatch core: shared data model, errors, configuration and the
//! capability registry.

pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheSettings, CollectionSettings, DataPaths, IpwatchConfig, RetentionSettings, SourceConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use registry::{Registry, ServiceInfo};
pub use types::{normalize_ip, CollectedIndicator, IndicatorRecord};
