//! Command events.
//!
//! A [`CommandListener`] registered on a connection hears about every command
//! dispatched once the connection is open:
//! - [`CommandStartedEvent`]: Before the command is written
//! - [`CommandSucceededEvent`]: After the reply passed the ok-check
//! - [`CommandFailedEvent`]: After any dispatch failure, including a decode
//!   failure after the succeeded event
//!
//! Security-sensitive commands are published with empty documents and
//! redacted failures.
//!
//! # Example
//!
//! ```ignore
//! use docwire_connection::{CommandListener, CommandSucceededEvent};
//!
//! struct SlowCommandLog;
//!
//! impl CommandListener for SlowCommandLog {
//!     fn command_succeeded(&self, event: &CommandSucceededEvent) {
//!         if event.elapsed.as_millis() > 100 {
//!             println!("slow {}: {:?}", event.command_name, event.elapsed);
//!         }
//!     }
//! }
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bson::{Document, RawDocument};
use docwire_core::{
    CommandMessage, ConnectionError, command_body, is_security_sensitive, to_document,
};

use crate::description::ConnectionId;

/// A command is about to be written.
#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub connection_id: ConnectionId,
    pub request_id: u32,
    pub timestamp: SystemTime,
    pub database_name: String,
    pub command_name: String,
    /// The command with any `$query` wrapper removed, or an empty document
    /// for a security-sensitive command.
    pub command: Document,
}

/// A command's reply passed the ok-check.
#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    pub connection_id: ConnectionId,
    pub request_id: u32,
    pub command_name: String,
    pub elapsed: Duration,
    /// The reply, or an empty document for a security-sensitive command.
    pub reply: Document,
}

/// A command failed.
#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    pub connection_id: ConnectionId,
    pub request_id: u32,
    pub command_name: String,
    pub elapsed: Duration,
    /// The error returned to the caller, redacted for a security-sensitive command.
    pub failure: ConnectionError,
}

/// Observes commands dispatched on a connection.
///
/// All methods have default no-op implementations. A listener that panics is
/// logged and otherwise ignored.
pub trait CommandListener: Send + Sync {
    fn command_started(&self, event: &CommandStartedEvent) {
        let _ = event;
    }

    fn command_succeeded(&self, event: &CommandSucceededEvent) {
        let _ = event;
    }

    fn command_failed(&self, event: &CommandFailedEvent) {
        let _ = event;
    }
}

impl<L: CommandListener + ?Sized> CommandListener for Arc<L> {
    fn command_started(&self, event: &CommandStartedEvent) {
        (**self).command_started(event);
    }

    fn command_succeeded(&self, event: &CommandSucceededEvent) {
        (**self).command_succeeded(event);
    }

    fn command_failed(&self, event: &CommandFailedEvent) {
        (**self).command_failed(event);
    }
}

/// Publishes command events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCommandListener;

impl CommandListener for LoggingCommandListener {
    fn command_started(&self, event: &CommandStartedEvent) {
        tracing::debug!(
            connection = %event.connection_id,
            request_id = event.request_id,
            database = %event.database_name,
            command = %event.command_name,
            "command started"
        );
    }

    fn command_succeeded(&self, event: &CommandSucceededEvent) {
        tracing::debug!(
            connection = %event.connection_id,
            request_id = event.request_id,
            command = %event.command_name,
            elapsed_us = event.elapsed.as_micros() as u64,
            "command succeeded"
        );
    }

    fn command_failed(&self, event: &CommandFailedEvent) {
        tracing::warn!(
            connection = %event.connection_id,
            request_id = event.request_id,
            command = %event.command_name,
            elapsed_us = event.elapsed.as_micros() as u64,
            error = %event.failure,
            "command failed"
        );
    }
}

/// Tracks one command's events.
///
/// Succeeded is published at most once and never after failed. Failed is
/// published at most once, even after succeeded.
pub(crate) struct CommandEventSender {
    listener: Option<Arc<dyn CommandListener>>,
    connection_id: ConnectionId,
    request_id: u32,
    command_name: String,
    sensitive: bool,
    started: Instant,
    succeeded: bool,
    failed: bool,
}

impl CommandEventSender {
    /// Start tracking `message`, publishing the started event if `listener` is set.
    pub(crate) fn start(
        listener: Option<Arc<dyn CommandListener>>,
        connection_id: &ConnectionId,
        message: &CommandMessage,
    ) -> Self {
        let command_name = message.command_name().to_owned();
        let sensitive = is_security_sensitive(&command_name);
        let sender = Self {
            listener,
            connection_id: connection_id.clone(),
            request_id: message.request_id(),
            command_name,
            sensitive,
            started: Instant::now(),
            succeeded: false,
            failed: false,
        };

        if let Some(listener) = &sender.listener {
            let event = CommandStartedEvent {
                connection_id: sender.connection_id.clone(),
                request_id: sender.request_id,
                timestamp: SystemTime::now(),
                database_name: message.namespace().database_name().to_owned(),
                command_name: sender.command_name.clone(),
                command: if sensitive {
                    Document::new()
                } else {
                    command_body(message.command()).clone()
                },
            };
            notify(&sender.command_name, || listener.command_started(&event));
        }
        sender
    }

    pub(crate) fn succeeded(&mut self, reply: &RawDocument) {
        if self.succeeded || self.failed {
            return;
        }
        self.succeeded = true;
        let Some(listener) = &self.listener else {
            return;
        };
        let reply = if self.sensitive {
            Document::new()
        } else {
            to_document(reply).unwrap_or_default()
        };
        let event = CommandSucceededEvent {
            connection_id: self.connection_id.clone(),
            request_id: self.request_id,
            command_name: self.command_name.clone(),
            elapsed: self.started.elapsed(),
            reply,
        };
        notify(&self.command_name, || listener.command_succeeded(&event));
    }

    pub(crate) fn failed(&mut self, error: &ConnectionError) {
        if self.failed {
            return;
        }
        self.failed = true;
        let Some(listener) = &self.listener else {
            return;
        };
        let event = CommandFailedEvent {
            connection_id: self.connection_id.clone(),
            request_id: self.request_id,
            command_name: self.command_name.clone(),
            elapsed: self.started.elapsed(),
            failure: if self.sensitive {
                error.redacted()
            } else {
                error.clone()
            },
        };
        notify(&self.command_name, || listener.command_failed(&event));
    }
}

fn notify<F: FnOnce()>(command_name: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(command = command_name, "command listener panicked, event dropped");
    }
}
