pub mod archive;
pub mod catalog;
pub mod events;
pub mod host;
pub mod index;
pub mod isolated;
pub mod manager;
pub mod worker;
