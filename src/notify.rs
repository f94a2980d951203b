//! User-facing notifications
//!
//! Store operations never surface errors into the rendering path. Instead
//! they emit a [`Notice`], which a UI renders as a non-blocking toast.

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Severity of a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    /// Informational, e.g. a completed action
    Info,
    /// An operation failed; state was kept or rolled back
    Error,
}

/// One toast-style notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Text shown to the user
    pub message: String,
}

/// Sending half, cloned into every store
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notice>,
}

/// Receiving half, owned by the UI
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

impl Notifier {
    /// Create a connected notifier/receiver pair
    pub fn channel() -> (Self, NoticeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an informational notice
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("notice: {}", message);
        self.emit(NoticeLevel::Info, message);
    }

    /// Emit an error notice
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("error notice: {}", message);
        self.emit(NoticeLevel::Error, message);
    }

    fn emit(&self, level: NoticeLevel, message: String) {
        // A closed receiver means the UI is gone; the log line above remains
        let _ = self.tx.send(Notice { level, message });
    }
}
