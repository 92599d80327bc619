pub mod config;
pub mod pages;
pub mod render;

pub use config::load_config;
pub use render::LogRenderer;
