//! Handler Router
//!
//! Applications declare interest in a topic and may rewrite the envelope.
//! The [`Router`] tries them in registration order; the first application
//! that accepts the topic gets the envelope. A result is trusted only when
//! the application succeeded and the rewritten envelope still has a
//! non-empty topic and a JSON payload. Otherwise the original envelope
//! passes through unchanged: an unroutable topic is never dropped.

use std::sync::Arc;
use tracing::{debug, warn};
use tunnel_event::{is_valid_json, Envelope};

/// Error returned by an application that declines an envelope
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Application declined envelope: {0}")]
    Declined(String),

    #[error("Application failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// A pluggable envelope handler
pub trait Application: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this application claims `topic`
    fn accepts(&self, topic: &str) -> bool;

    /// Transform a claimed envelope
    fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError>;
}

/// Ordered list of applications
#[derive(Clone, Default)]
pub struct Router {
    applications: Vec<Arc<dyn Application>>,
}

impl Router {
    /// Create a router with no applications
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an application; earlier registrations win ties
    pub fn register(&mut self, application: Arc<dyn Application>) {
        self.applications.push(application);
    }

    /// Number of registered applications
    pub fn len(&self) -> usize {
        self.applications.len()
    }

    /// Whether no applications are registered
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    /// Route an envelope through the first application that accepts it.
    ///
    /// A rejected result falls through to the next accepting application,
    /// and finally to the original envelope.
    pub fn route(&self, envelope: Envelope) -> Envelope {
        for app in &self.applications {
            if !app.accepts(&envelope.topic) {
                continue;
            }

            match app.handle(envelope.clone()) {
                Ok(out) if is_acceptable(&out) => {
                    debug!(application = app.name(), topic = %out.topic, "Envelope routed");
                    return out;
                }
                Ok(out) => {
                    warn!(
                        application = app.name(),
                        topic = %out.topic,
                        "Application returned an invalid envelope, falling through"
                    );
                }
                Err(e) => {
                    debug!(application = app.name(), error = %e, "Application declined envelope");
                }
            }
        }

        envelope
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.applications.iter().map(|a| a.name()))
            .finish()
    }
}

fn is_acceptable(envelope: &Envelope) -> bool {
    !envelope.topic.trim().is_empty() && is_valid_json(&envelope.payload)
}
