//! Host runtime boundary.
//!
//! The engine never touches the hosting platform directly. Messages, kicks and
//! command dispatch all go through this trait, and anything that must run on
//! the host's own execution context is marshalled via [`HostRuntime::run_on_host_context`].

use tracing::info;
use uuid::Uuid;

/// A closure marshalled onto the host execution context.
pub type HostTask = Box<dyn FnOnce() + Send>;

/// The hosting platform's view of connected principals.
pub trait HostRuntime: Send + Sync {
    /// Whether the principal is currently addressable (fully connected).
    fn is_addressable(&self, principal: &Uuid) -> bool;

    /// Run a task on the host's own execution context. The host context may be
    /// single-threaded cooperative; this is the only required handoff point.
    fn run_on_host_context(&self, task: HostTask);

    fn send_message(&self, principal: &Uuid, text: &str);

    fn disconnect(&self, principal: &Uuid, reason: &str);

    /// Dispatch a command line as the host's console identity.
    fn dispatch_command(&self, command: &str);

    /// Currently-connected principals that have alerts enabled.
    fn alert_recipients(&self) -> Vec<Uuid>;
}

/// Runtime adapter for the CLI binary. Nothing is ever addressable; host-bound
/// side effects are logged instead of delivered.
pub struct ConsoleRuntime;

impl HostRuntime for ConsoleRuntime {
    fn is_addressable(&self, _principal: &Uuid) -> bool {
        false
    }

    fn run_on_host_context(&self, task: HostTask) {
        task();
    }

    fn send_message(&self, principal: &Uuid, text: &str) {
        info!(principal = %principal, message = %text, "alert");
    }

    fn disconnect(&self, principal: &Uuid, reason: &str) {
        info!(principal = %principal, reason = %reason, "would disconnect");
    }

    fn dispatch_command(&self, command: &str) {
        info!(command = %command, "would dispatch command");
    }

    fn alert_recipients(&self) -> Vec<Uuid> {
        Vec::new()
    }
}
