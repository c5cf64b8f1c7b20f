//! A minimal multi-buffered frame loop: a fence-based CPU/GPU synchronizer,
//! a swap chain wrapper and a renderer that clears and presents one frame per
//! call.
//!
//! Components are generic over a [`backend::Backend`]. The Direct3D 12
//! backend lives in `d3d12` (Windows only); [`headless`] simulates a GPU
//! deterministically.

pub mod backend;
pub mod config;
pub mod context;
#[cfg(windows)]
pub mod d3d12;
pub mod error;
pub mod fence;
pub mod headless;
pub mod logging;
pub mod presentation;
pub mod renderer;
pub mod report;
