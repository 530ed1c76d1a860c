//! Lifecycle of the out-of-process approval surface.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::ConfigError;

/// How the approval surface is presented to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    /// No separate surface; approvals render inside the extension popup.
    Embedded,
    Window,
    Popup,
}

impl FromStr for NotificationMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "embedded" => Ok(Self::Embedded),
            "window" => Ok(Self::Window),
            "popup" => Ok(Self::Popup),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Opaque handle to an open approval surface, issued by the driver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub String);

/// Failure reported by a surface driver.
#[derive(Debug, Error, Clone)]
#[error("surface driver failure: {0}")]
pub struct SurfaceError(pub String);

/// Capability that actually opens and closes approval surfaces; the
/// browser shell implements it, the arbiter only tracks handles.
#[async_trait]
pub trait SurfaceDriver: Send + Sync {
    async fn open(&self, mode: NotificationMode) -> Result<SurfaceId, SurfaceError>;
    async fn close(&self, id: &SurfaceId) -> Result<(), SurfaceError>;
}

/// Tracks the surfaces currently open for pending requests.
///
/// Driver failures are warned and swallowed: a broken shell must not fail
/// the request that triggered the surface.
pub struct NotificationChannel {
    mode: NotificationMode,
    driver: Arc<dyn SurfaceDriver>,
    handles: Vec<SurfaceId>,
}

impl NotificationChannel {
    pub fn new(mode: NotificationMode, driver: Arc<dyn SurfaceDriver>) -> Self {
        Self {
            mode,
            driver,
            handles: Vec::new(),
        }
    }

    pub fn set_mode(&mut self, mode: NotificationMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> NotificationMode {
        self.mode
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Open a new surface for a freshly queued request.
    pub async fn ensure_open(&mut self) {
        if self.mode == NotificationMode::Embedded {
            return;
        }
        match self.driver.open(self.mode).await {
            Ok(id) => self.handles.push(id),
            Err(err) => warn!("failed to open approval surface: {err}"),
        }
    }

    /// Close every tracked surface once no request is pending anywhere.
    ///
    /// Handles are cleared even when a close fails, so none is leaked in a
    /// half-tracked state.
    pub async fn close_all_if_empty(&mut self, pending_total: usize) {
        if pending_total > 0 {
            return;
        }
        for id in self.handles.drain(..) {
            if let Err(err) = self.driver.close(&id).await {
                warn!("failed to close approval surface {}: {err}", id.0);
            }
        }
    }
}

/// Driver that mints handles in memory; suitable for unit tests and
/// headless embedding.
#[derive(Debug, Default)]
pub struct InMemorySurface {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl InMemorySurface {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SurfaceDriver for InMemorySurface {
    async fn open(&self, _mode: NotificationMode) -> Result<SurfaceId, SurfaceError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SurfaceId(Uuid::new_v4().to_string()))
    }

    async fn close(&self, _id: &SurfaceId) -> Result<(), SurfaceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
