pub mod conditioner;
pub mod error;
pub mod http;
pub mod safe_path;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod transcoder;
pub mod webdav;

pub use state::AppState;
