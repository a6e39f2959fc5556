//! Notification boundary. Toast presentation itself is out of scope; the
//! pipeline only emits titles and bodies.

use log::info;

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Default sink: writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("{title}: {body}");
    }
}
