pub mod netns;
pub mod registry;
pub mod types;

pub use netns::{HostNetns, NetnsRunner};
pub use registry::ContainerRegistry;
pub use types::Container;
