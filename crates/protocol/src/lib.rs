pub mod config;
pub mod messages;
pub mod profile;
pub mod rtp;

pub use config::*;
pub use messages::*;
pub use profile::*;
pub use rtp::*;
