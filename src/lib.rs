pub mod config_loader;
pub mod e621;
pub mod logger;
pub mod pipeline;
pub mod program;
pub mod status;
