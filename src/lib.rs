//! # tilecast
//!
//! A content rotation and delivery server for small pixel-matrix display
//! tiles.
//!
//! Each tile has an ordered list of app installations. The server decides
//! what the tile shows next, asks an external renderer for a fresh image
//! when one is due, and delivers it:
//!
//! - **Pull**: the tile polls for one image at a time
//! - **Persistent**: the server pushes frames over a websocket and paces
//!   itself on the tile's acknowledgments
//!
//! Out-of-band pushes interrupt the persistent loop, and dashboard observers
//! are told when what a tile displays changes.
//!
//! ## Quick Start (axum)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tilecast::{axum_ext::router, CommandRenderer, Config, Engine, MemoryStore};
//!
//! let config = Config::load("tilecast.yaml")?;
//! let store = Arc::new(MemoryStore::load("devices.yaml")?);
//! let renderer = Arc::new(CommandRenderer::new(config.render.clone()));
//! let engine = Arc::new(Engine::new(config, store, renderer));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, router(engine)).await?;
//! ```
//!
//! ## Display
//!
//! Tiles are 64x32 pixels. Images are WebP; apps may render at 2x for tiles
//! that support it.
//!
//! ## Feature Flags
//!
//! - `axum` - Router with pull, websocket, push and dashboard endpoints
//! - `full` - All features

pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
mod error;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod pull;
pub mod render;
pub mod rotation;
pub mod schedule;
pub mod session;
pub mod store;

#[cfg(feature = "axum")]
pub mod axum_ext;

#[cfg(test)]
mod testing;

pub use auth::TokenAuth;
pub use cache::{ImageKey, ImageStore};
pub use config::Config;
pub use engine::{Engine, Frame};
pub use error::{Error, Result};
pub use model::{ColorFilter, Device, DimMode, Installation, NightMode, Transport};
pub use notify::{Notification, Notifier};
pub use pull::{next_pull, PullResponse};
pub use render::{CommandRenderer, RenderConfig, RenderOrchestrator, Renderer};
pub use rotation::{determine_next, Selection};
pub use session::run_session;
pub use store::{DeviceStore, DeviceUpdate, MemoryStore};

/// Tile width in pixels
pub const DISPLAY_WIDTH: u32 = 64;

/// Tile height in pixels
pub const DISPLAY_HEIGHT: u32 = 32;

/// Image served when nothing else is displayable (1x1 WebP)
pub const DEFAULT_IMAGE: &[u8] = include_bytes!("../assets/default.webp");
