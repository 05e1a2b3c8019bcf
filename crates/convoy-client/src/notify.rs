use crate::log::LogEntry;

/// Best-effort alert for a message from someone else. Failures are logged
/// and never affect the session.
pub trait Notifier: Send + Sync {
    fn notify(&self, entry: &LogEntry) -> Result<(), String>;
}

/// Emits a tracing event instead of a platform notification.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, entry: &LogEntry) -> Result<(), String> {
        tracing::info!(
            conversation_id = %entry.conversation_id,
            sender_id = %entry.sender_id,
            sender = entry.sender_name.as_deref().unwrap_or(""),
            "New message"
        );
        Ok(())
    }
}
