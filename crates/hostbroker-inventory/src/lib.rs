//! hostbroker-inventory: local record of checked-out hosts
//!
//! Provides the inventory entry type, the filter language used to select
//! entries, listing field resolution and the locked YAML file store.

pub mod entry;
pub mod error;
pub mod fields;
pub mod filter;
pub mod store;

pub use entry::{InventoryEntry, merge_maps};
pub use error::InventoryError;
pub use fields::{InventoryField, ProviderActions};
pub use filter::Filter;
pub use store::InventoryStore;
