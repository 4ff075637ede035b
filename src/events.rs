use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Event families the core publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    TaskLifecycle,
    TesterRecovery,
    CiPrLifecycle,
    TerminalOutcome,
}

impl std::fmt::Display for EventFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventFamily::TaskLifecycle => "task-lifecycle",
            EventFamily::TesterRecovery => "tester-recovery",
            EventFamily::CiPrLifecycle => "ci-pr-lifecycle",
            EventFamily::TerminalOutcome => "terminal-outcome",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Info,
    Important,
    Critical,
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionLevel {
    #[default]
    All,
    Important,
    Critical,
}

impl SubscriptionLevel {
    pub fn accepts(&self, level: EventLevel) -> bool {
        match self {
            SubscriptionLevel::All => true,
            SubscriptionLevel::Important => level >= EventLevel::Important,
            SubscriptionLevel::Critical => level >= EventLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub family: EventFamily,
    pub name: String,
    pub level: EventLevel,
    pub message: String,
    /// Events sharing a dedup key are delivered at most once per subscriber.
    pub dedup_key: Option<String>,
}

impl RuntimeEvent {
    pub fn new(family: EventFamily, name: &str, level: EventLevel, message: &str) -> Self {
        Self {
            family,
            name: name.to_string(),
            level,
            message: message.to_string(),
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: &str) -> Self {
        self.dedup_key = Some(key.to_string());
        self
    }
}

struct SubscriberState {
    level: SubscriptionLevel,
    seen: HashSet<String>,
    sender: mpsc::UnboundedSender<RuntimeEvent>,
}

/// In-process fan-out of runtime events.
///
/// The core publishes; external transports subscribe with a level filter.
/// Closed receivers are pruned on the next publish.
#[derive(Default)]
pub struct RuntimeEventBus {
    subscribers: Mutex<Vec<SubscriberState>>,
}

impl RuntimeEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, level: SubscriptionLevel) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.push(SubscriberState {
            level,
            seen: HashSet::new(),
            sender,
        });
        receiver
    }

    pub fn publish(&self, event: RuntimeEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain_mut(|sub| {
            if !sub.level.accepts(event.level) {
                return !sub.sender.is_closed();
            }
            if let Some(key) = &event.dedup_key {
                if !sub.seen.insert(key.clone()) {
                    return !sub.sender.is_closed();
                }
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }
}
