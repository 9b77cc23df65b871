pub mod artifact;
pub mod config;
pub mod extractor;
pub mod logging;
pub mod media;
pub mod relay;
