pub use tokio;

pub mod events;
pub mod helpers;
