//! Folder-driven picture-frame slideshow engine.
//!
//! A folder watcher keeps an [`library::ImageLibrary`] in sync with a shared
//! directory; the display loop cycles through it, rendering each image onto
//! the exact canvas of a [`platform::device::DeviceSink`].

pub mod canvas;
pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod render;
pub mod timing;
pub mod platform {
    pub mod device;
    pub mod framebuffer;
    pub mod panel;
}
pub mod processing {
    pub mod color;
    pub mod layout;
}
pub mod tasks {
    pub mod files;
    pub mod slideshow;
}
