pub mod config;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod meta;
pub mod model;
pub mod selection;
pub mod service;
pub mod storage;
pub mod store;
pub mod web;
pub mod platform {
    pub mod display_sink;
}
pub mod processing {
    pub mod crop;
    pub mod layout;
    pub mod render;
}
pub mod tasks {
    pub mod display;
    pub mod slideshow;
    pub mod upload;
    pub mod worker;
}

pub use error::{Error, Result};
pub use service::{FrameOptions, PhotoFrame};
