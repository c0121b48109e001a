#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![warn(clippy::cast_sign_loss)]

pub mod base_types;
mod context;
mod domain;
mod dva;
mod error;
mod extent_index;
mod group;
mod metaslab;
mod space_map;
mod strategy;
mod tunables;

pub use crate::context::DeviceHealth;
pub use crate::context::ManualTxgContext;
pub use crate::context::StaticHealth;
pub use crate::context::TxgContext;
pub use crate::domain::AllocationDomain;
pub use crate::domain::DomainKind;
pub use crate::error::MetaslabError;
pub use crate::error::Result;
pub use crate::group::MetaslabGroup;
pub use crate::metaslab::Activation;
pub use crate::metaslab::Metaslab;
pub use crate::metaslab::Weight;
pub use crate::space_map::ExtentIndexPhys;
pub use crate::space_map::MemorySpaceMapStore;
pub use crate::space_map::SpaceMapEntry;
pub use crate::space_map::SpaceMapExtent;
pub use crate::space_map::SpaceMapStore;
pub use crate::space_map::SPACE_MAP_ENTRY_SIZE;
pub use crate::strategy::StrategyKind;
pub use crate::tunables::Tunables;
