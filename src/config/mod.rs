//! YAML configuration: the on-disk document, its validation into runtime
//! settings, and writing it back.

pub mod load;
pub mod model;
pub mod save;

pub use load::{default_config_path, load_config};
pub use model::{Config, DestinationSettings, RuntimeConfig};
