use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, RwLock,
    },
};

use tracing::{debug, info};

/// UI-side notification surface: sound plus toast.
pub trait Notifier: Send + Sync {
    fn play_sound(&self);
    fn toast(&self, title: &str, body: &str);
}

/// Process-wide notification sound, initialised on first use and kept until
/// process exit.
pub struct NotificationSound {
    asset: Option<PathBuf>,
    plays: AtomicU64,
}

impl NotificationSound {
    fn load() -> Self {
        let asset = std::env::var_os("CHAT_NOTIFICATION_SOUND").map(PathBuf::from);
        info!(asset = ?asset, "notify: notification sound initialised");
        Self {
            asset,
            plays: AtomicU64::new(0),
        }
    }

    pub fn play(&self) {
        let count = self.plays.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(asset = ?self.asset, count, "notify: playing notification sound");
    }

    pub fn play_count(&self) -> u64 {
        self.plays.load(Ordering::Relaxed)
    }
}

pub fn notification_sound() -> &'static NotificationSound {
    static SOUND: OnceLock<NotificationSound> = OnceLock::new();
    SOUND.get_or_init(NotificationSound::load)
}

/// Default notifier: plays the shared sound and logs toasts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn play_sound(&self) {
        notification_sound().play();
    }

    fn toast(&self, title: &str, body: &str) {
        info!(title, body, "notify: toast");
    }
}

/// Swappable handle. Readers always observe the most recently installed value.
pub struct HandlerCell<T: ?Sized> {
    current: RwLock<Arc<T>>,
}

impl<T: ?Sized> HandlerCell<T> {
    pub fn new(initial: Arc<T>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, next: Arc<T>) {
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}
