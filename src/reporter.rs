use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Local-only event kinds that are counted instead of failing the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketDrop,
    NetFilter,
    NetScan,
    MaxTcpChannel,
    MaxTcpConnectWait,
    ChannelClosed,
    RedirectLoop,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PacketDrop => "packet_drop",
            EventKind::NetFilter => "net_filter",
            EventKind::NetScan => "net_scan",
            EventKind::MaxTcpChannel => "max_tcp_channel",
            EventKind::MaxTcpConnectWait => "max_tcp_connect_wait",
            EventKind::ChannelClosed => "channel_closed",
            EventKind::RedirectLoop => "redirect_loop",
        }
    }
}

/// Per-packet failures are frequent and bursty; logging each one would melt
/// the log volume. Every event is counted, but at most one line per kind is
/// emitted within the window.
#[derive(Debug)]
pub struct EventReporter {
    window: Duration,
    last_logged: Mutex<HashMap<EventKind, Instant>>,
    counters: Mutex<HashMap<EventKind, u64>>,
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl EventReporter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn report(&self, kind: EventKind, detail: &str) {
        let total = {
            let mut counters = self.counters.lock().expect("reporter counters poisoned");
            let c = counters.entry(kind).or_insert(0);
            *c += 1;
            *c
        };

        let mut last = self.last_logged.lock().expect("reporter stamps poisoned");
        let now = Instant::now();
        let due = match last.get(&kind) {
            Some(prev) => now.duration_since(*prev) >= self.window,
            None => true,
        };
        if due {
            last.insert(kind, now);
            drop(last);
            tracing::warn!(kind = kind.as_str(), total, detail, "session event");
        }
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.counters
            .lock()
            .expect("reporter counters poisoned")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_is_counted() {
        let r = EventReporter::new(Duration::from_secs(10));
        for _ in 0..100 {
            r.report(EventKind::PacketDrop, "full queue");
        }
        r.report(EventKind::NetFilter, "blocked");
        assert_eq!(r.count(EventKind::PacketDrop), 100);
        assert_eq!(r.count(EventKind::NetFilter), 1);
        assert_eq!(r.count(EventKind::NetScan), 0);
    }

    #[test]
    fn kinds_render_spec_names() {
        assert_eq!(EventKind::MaxTcpConnectWait.as_str(), "max_tcp_connect_wait");
        assert_eq!(EventKind::ChannelClosed.as_str(), "channel_closed");
    }
}
