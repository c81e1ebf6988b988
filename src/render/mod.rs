//! Progressive rendering: batch loop, readback, denoise and output.
//!
//! - [`ProgressiveRenderer`] - Blocking render loop and its state machine
//! - [`RenderWorker`] - Same loop on a background thread
//! - [`RenderParams`] / [`RendererConfig`] - Per-render and per-renderer settings
//! - [`Denoiser`] / [`ImageWriter`] - Post-process and disk seams

mod batch;
mod denoise;
mod output;
mod params;
mod readback;
mod renderer;
mod state;
mod worker;

pub use batch::BatchPlan;
pub use denoise::{BilateralDenoiser, Denoiser, Passthrough};
pub use output::{intermediate_path, tone_map, FileImageWriter, FloatImage, ImageWriter};
pub use params::{OutputKind, RenderParams, RendererConfig};
pub use readback::unpack_rows;
pub use renderer::{ProgressiveRenderer, RenderOutcome, RenderReport};
pub use state::{FailureReason, RenderObserver, RenderState, RenderStatus};
pub use worker::{RenderCommand, RenderEvent, RenderWorker};
