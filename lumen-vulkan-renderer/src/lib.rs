//! The Vulkan rendering backend of the Lumen compositing window manager.
//!
//! Given a depth-ordered list of window surfaces, this crate produces one
//! composited frame per output: every surface gets a blurred-transparency
//! backdrop sampled from the composite underneath it, a per-pixel identity
//! buffer records which surface owns each pixel for hit-testing, and a
//! final postprocess pass blends the result (optionally between two color
//! schemes) into the presentable image. Presentable buffers and client
//! textures both arrive as dmabufs and are imported zero-copy.
//!
//! ## Core components
//!
//! - **`error`**: `VulkanError` and the crate-wide `Result` alias.
//! - **`config`**: `RendererConfig`, loaded from the compositor's TOML.
//! - **`device`**: headless instance/device bootstrap (`VulkanContext`).
//! - **`sync`**: layout transitions, queue-ownership barriers, image copy,
//!   one-shot submission.
//! - **`timers`**: GPU timestamp ring with rolling per-operation averages.
//! - **`staging`**: bump-allocated host-visible transfer arena, rewound
//!   once per frame.
//! - **`descriptors`**: growable pools of sampled-image bindings.
//! - **`texture`**: dmabuf texture import, queue-ownership state machine,
//!   deferred destruction.
//! - **`scene`**: the data model shared with the windowing collaborator.
//! - **`pipelines`**: format-keyed render passes and the four pipelines
//!   (fill, composite, blur, postprocess) plus the shared push-constant
//!   block.
//! - **`render_target`**: per-output image sets (final, depth, identity +
//!   mirror, intermediates, blur chain) and their lifecycle.
//! - **`frame`**: `FrameRenderer`, the per-frame `begin → draw → end`
//!   orchestrator and the crate's entry point.
//!
//! ## Usage
//!
//! The session layer owns surface state and calls a single entry point per
//! frame:
//!
//! ```ignore
//! let mut renderer = FrameRenderer::new(RendererConfig::default())?;
//! let presented = renderer.draw_frame(&mut output, &surfaces, focused, params)?;
//! ```
//!
//! Rendering is fully synchronous: `draw_frame` records one command
//! stream, submits it and waits for the fence before returning, so by the
//! time control returns every staging allocation is rewindable and every
//! pending-destroy texture is safe to free.

pub mod error;
pub use error::{Result, VulkanError};

pub mod config;
pub mod descriptors;
pub mod device;
pub mod frame;
pub mod pipelines;
pub mod render_target;
pub mod scene;
pub mod staging;
pub mod sync;
pub mod texture;
pub mod timers;

pub use config::{ColorScheme, DisplayMode, RendererConfig, MAX_BLUR_PASSES};
pub use frame::{FrameRenderer, SurfaceHit};
pub use scene::{
    CompositorOutput, DmabufSource, FrameParams, OutputBuffer, OutputId, RenderSurface, TextureId,
};
pub use timers::Timer;
