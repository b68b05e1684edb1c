pub mod base;
pub mod manager;
pub mod terminal;
pub mod web;

pub use base::Channel;
pub use manager::ChannelManager;
