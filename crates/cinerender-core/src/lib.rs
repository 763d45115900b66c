//! cinerender-core: render job model, wire format and digests.
//! The transport and worker protocol in cinerender-net build on this crate.

pub mod colour;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod geometry;
pub mod image;
pub mod wire;

pub use descriptor::{JobDescriptor, PositionImage, RgbaImage};
pub use geometry::{Crop, Position, Size};
pub use wire::{Eyes, Part};
