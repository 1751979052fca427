//! Online/offline signal consulted before any live remote call.
//!
//! The monitor does not poll. It is seeded from a [`ReachabilityProbe`] and
//! then kept current by whoever observes network changes: the platform
//! integration calls [`ConnectivityMonitor::set_online`], or hands over a
//! stream of events with [`ConnectivityMonitor::attach`].

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{Error, Result};

/// Answers "is the network usable right now?"
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
  /// `Err` means the probe itself is unavailable, not that we are offline.
  async fn check(&self) -> Result<bool>;
}

/// Probe that tries a TCP connect to the remote service's host.
pub struct TcpProbe {
  host: String,
  port: u16,
  timeout: Duration,
}

impl TcpProbe {
  pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
    Self {
      host: host.into(),
      port,
      timeout,
    }
  }

  /// Probe the host and port of a service URL.
  pub fn for_url(url: &str, timeout: Duration) -> Result<Self> {
    let parsed =
      Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL {}: {}", url, e)))?;
    let host = parsed
      .host_str()
      .ok_or_else(|| Error::Config(format!("URL {} has no host", url)))?;
    let port = parsed
      .port_or_known_default()
      .ok_or_else(|| Error::Config(format!("URL {} has no port", url)))?;

    Ok(Self::new(host, port, timeout))
  }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
  async fn check(&self) -> Result<bool> {
    let connect = TcpStream::connect((self.host.as_str(), self.port));
    match tokio::time::timeout(self.timeout, connect).await {
      Ok(Ok(_)) => Ok(true),
      Ok(Err(e)) => {
        tracing::debug!("{}:{} unreachable: {}", self.host, self.port, e);
        Ok(false)
      }
      Err(_) => {
        tracing::debug!("{}:{} probe timed out", self.host, self.port);
        Ok(false)
      }
    }
  }
}

/// Shared, continuously updated online flag.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (state, _) = watch::channel(online);
    Self {
      state: Arc::new(state),
    }
  }

  /// Seed the flag from a probe. An unavailable probe starts us offline.
  pub async fn with_probe(probe: &dyn ReachabilityProbe) -> Self {
    let monitor = Self::new(false);
    monitor.refresh(probe).await;
    monitor
  }

  /// Re-query the probe. If it fails, the last known state is kept.
  pub async fn refresh(&self, probe: &dyn ReachabilityProbe) -> bool {
    match probe.check().await {
      Ok(online) => self.set_online(online),
      Err(e) => tracing::warn!("Reachability probe unavailable, keeping last state: {}", e),
    }
    self.is_online()
  }

  pub fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  /// Record a network state change. Subscribers only wake on actual transitions.
  pub fn set_online(&self, online: bool) {
    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      tracing::info!(
        "Connectivity changed: {}",
        if online { "online" } else { "offline" }
      );
    }
  }

  /// Receiver that wakes on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }

  /// Feed network change events from the platform into the monitor.
  pub fn attach<S>(&self, events: S) -> JoinHandle<()>
  where
    S: Stream<Item = bool> + Send + 'static,
  {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut events = Box::pin(events);
      while let Some(online) = events.next().await {
        monitor.set_online(online);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FixedProbe(Result<bool>);

  #[async_trait]
  impl ReachabilityProbe for FixedProbe {
    async fn check(&self) -> Result<bool> {
      match &self.0 {
        Ok(online) => Ok(*online),
        Err(_) => Err(Error::Network("no network service".to_string())),
      }
    }
  }

  #[tokio::test]
  async fn test_seeded_from_probe() {
    let monitor = ConnectivityMonitor::with_probe(&FixedProbe(Ok(true))).await;
    assert!(monitor.is_online());
  }

  #[tokio::test]
  async fn test_probe_failure_keeps_last_state() {
    let monitor = ConnectivityMonitor::new(true);
    let failing = FixedProbe(Err(Error::Network(String::new())));

    assert!(monitor.refresh(&failing).await);

    monitor.set_online(false);
    assert!(!monitor.refresh(&failing).await);
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions_only() {
    let monitor = ConnectivityMonitor::new(false);
    let mut rx = monitor.subscribe();

    monitor.set_online(false);
    assert!(!rx.has_changed().unwrap());

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_attach_event_stream() {
    let monitor = ConnectivityMonitor::new(false);
    let handle = monitor.attach(futures::stream::iter(vec![true, false, true]));
    handle.await.unwrap();
    assert!(monitor.is_online());
  }

  #[test]
  fn test_probe_for_url() {
    let probe = TcpProbe::for_url("https://agents.example.com/api", Duration::from_secs(1)).unwrap();
    assert_eq!(probe.host, "agents.example.com");
    assert_eq!(probe.port, 443);
    assert!(TcpProbe::for_url("not a url", Duration::from_secs(1)).is_err());
  }
}
