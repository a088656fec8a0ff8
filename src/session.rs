//! # Session Handler Boundary
//!
//! The conversational engine that actually produces and consumes audio is an
//! external component. This module defines the narrow capability trait the
//! connection layer drives, the emission model, and a placeholder
//! implementation used until the real engine is wired in.
//!
//! ## Lifecycle contract:
//! Every successful transport connect gets a brand-new handler from the
//! factory; the handler lives exactly as long as that one session and is
//! cleaned up on disconnect. Handlers are never reused across reconnects, so
//! no conversation state leaks between dropped connections.
//!
//! ## Concurrency contract:
//! `receive` and `emit` are called concurrently from the two halves of the
//! duplex loop, so implementations take `&self` and synchronize internally.
//! `emit` should block until it has something to say (or pace itself);
//! returning `Ok(None)` means "nothing right now" and the caller polls again
//! immediately. `emit` is raced against the keep-alive ticker in a select!
//! and must therefore be cancel-safe (a queue pop, not a multi-step
//! transaction).

use crate::audio::PcmBuffer;
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One item produced by a session handler.
#[derive(Debug, Clone)]
pub enum Emission {
    /// A structured control event, forwarded to the device verbatim
    Event(serde_json::Value),

    /// Raw audio to be encoded and shipped as an audio-delta message
    Audio(PcmBuffer),
}

/// Capability interface for the conversational engine.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// One-time startup work (model sessions, upstream connections, ...).
    async fn start_up(&self) -> AppResult<()>;

    /// Feed decoded device audio into the engine.
    async fn receive(&self, sample_rate: u32, pcm: Vec<f32>) -> AppResult<()>;

    /// Produce the next outbound item, or None when idle.
    async fn emit(&self) -> AppResult<Option<Emission>>;

    /// Tear down; called exactly once per session, errors are swallowed by
    /// the caller.
    async fn cleanup(&self) -> AppResult<()>;
}

/// Produces a fresh handler for every transport session.
pub trait SessionHandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn SessionHandler>;
}

/// Placeholder engine: swallows inbound audio, emits nothing.
///
/// Keeps a connection fully operational (configuration, keep-alive, inbound
/// decode path) without any inference stack behind it, which is exactly what
/// integration environments and tests need.
#[derive(Debug, Default)]
pub struct PlaceholderSessionHandler {
    samples_received: AtomicU64,
}

#[async_trait]
impl SessionHandler for PlaceholderSessionHandler {
    async fn start_up(&self) -> AppResult<()> {
        debug!("Placeholder session handler started");
        Ok(())
    }

    async fn receive(&self, sample_rate: u32, pcm: Vec<f32>) -> AppResult<()> {
        let total = self
            .samples_received
            .fetch_add(pcm.len() as u64, Ordering::Relaxed)
            + pcm.len() as u64;
        debug!(
            sample_rate,
            samples = pcm.len(),
            total_samples = total,
            "Discarding inbound audio (placeholder handler)"
        );
        Ok(())
    }

    async fn emit(&self) -> AppResult<Option<Emission>> {
        // Idle engine: pace the poll loop at one frame interval instead of
        // spinning on None.
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        Ok(None)
    }

    async fn cleanup(&self) -> AppResult<()> {
        debug!(
            total_samples = self.samples_received.load(Ordering::Relaxed),
            "Placeholder session handler cleaned up"
        );
        Ok(())
    }
}

/// Factory for the placeholder handler.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderSessionFactory;

impl SessionHandlerFactory for PlaceholderSessionFactory {
    fn create(&self) -> Arc<dyn SessionHandler> {
        Arc::new(PlaceholderSessionHandler::default())
    }
}
