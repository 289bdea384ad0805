use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::network::{Accept, Connector, Endpoint, Listener, Stream};

use super::splice::splice;
use super::{RelayError, TerminalError};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for a relay session
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tear down pairs that move no bytes for this long. `None` keeps silent
    /// pairs open indefinitely.
    pub idle_timeout: Option<Duration>,
    /// How long to wait for in-flight pairs to close once the session ends
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// A bound listener plus everything needed to serve it
pub struct RelaySession {
    source: Endpoint,
    listener: Listener,
    connector: Arc<Connector>,
    config: RelayConfig,
}

impl RelaySession {
    /// Bind the source endpoint and prepare a connector for the destination
    pub async fn bind(
        source: &str,
        destination: &str,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let source = Endpoint::parse(source);
        let listener = Listener::bind(&source)
            .await
            .map_err(|e| RelayError::Bind {
                endpoint: source.clone(),
                source: e,
            })?;
        let session = Self {
            source,
            listener,
            connector: Arc::new(Connector::new(Endpoint::parse(destination))),
            config,
        };

        info!(
            source = %session.source,
            bound = %session
                .local_addr()
                .unwrap_or_else(|_| session.source.address().to_string()),
            destination = %session.connector.endpoint(),
            "Relay listening"
        );
        Ok(session)
    }

    /// Address actually bound, useful when listening on port 0
    pub fn local_addr(&self) -> std::io::Result<String> {
        self.listener.local_addr()
    }

    /// Accept and relay connections until the listener fails or `shutdown` fires
    ///
    /// Returns the accept error that ended the session, or `Ok(())` after a
    /// requested shutdown. In both cases in-flight pairs are cancelled and
    /// given `drain_timeout` to close before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let RelaySession {
            source,
            listener,
            connector,
            config,
        } = self;
        serve(&source, listener, connector, &config, shutdown).await
    }
}

/// Accept loop over any connection source, followed by the drain
///
/// `acceptor` is dropped as soon as the loop ends, before in-flight pairs are
/// drained, so no connection is accepted during teardown.
async fn serve<A: Accept>(
    source: &Endpoint,
    acceptor: A,
    connector: Arc<Connector>,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let terminal = TerminalError::new();
    let tracker = TaskTracker::new();
    let pairs = shutdown.child_token();
    let mut next_id: u64 = 0;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok((inbound, peer)) => {
                next_id += 1;
                let span = info_span!("pair", id = next_id, peer = %peer);
                tracker.spawn(
                    handle_pair(
                        inbound,
                        Arc::clone(&connector),
                        pairs.child_token(),
                        config.idle_timeout,
                    )
                    .instrument(span),
                );
            }
            Err(e) => {
                let err = RelayError::Accept {
                    endpoint: source.clone(),
                    source: e,
                };
                error!(
                    error = &err as &(dyn std::error::Error + 'static),
                    "Accept loop failed"
                );
                terminal.record(err);
                break;
            }
        }
    }

    drop(acceptor);
    pairs.cancel();
    tracker.close();
    if !tracker.is_empty() {
        info!(in_flight = tracker.len(), "Closing in-flight connections");
    }
    if tokio::time::timeout(config.drain_timeout, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = tracker.len(),
            "Connections still open after drain timeout"
        );
    }

    if terminal.is_set() {
        debug!("Relay session failed");
    }
    terminal.into_result()
}

/// Bind `source` and relay every accepted connection to `destination`
///
/// Runs until the listener fails (the error is returned) or `shutdown` is
/// cancelled.
pub async fn start(
    source: &str,
    destination: &str,
    config: RelayConfig,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    RelaySession::bind(source, destination, config)
        .await?
        .run(shutdown)
        .await
}

/// Dial the destination for one accepted connection and splice the two
async fn handle_pair(
    inbound: Stream,
    connector: Arc<Connector>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) {
    debug!("New connection");

    let dialed = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Cancelled while connecting to destination");
            return;
        }
        dialed = connector.connect() => dialed,
    };

    let outbound = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            let err = RelayError::Connect {
                endpoint: connector.endpoint().clone(),
                source: e,
            };
            warn!(
                error = &err as &(dyn std::error::Error + 'static),
                "Closing connection, destination unreachable"
            );
            return;
        }
    };
    debug!(destination = %connector.endpoint(), "Connected to destination");

    // Socket options only affect latency; a failure here never ends the pair.
    for (side, stream) in [("source", &inbound), ("destination", &outbound)] {
        if let Err(e) = stream.set_nodelay() {
            debug!(side, error = %e, "Could not disable Nagle");
        }
    }

    let report = splice(inbound, outbound, cancel, idle_timeout).await;
    for failure in &report.failures {
        warn!(
            error = failure as &(dyn std::error::Error + 'static),
            "Copy failed"
        );
    }
    info!(
        sent = report.upstream,
        received = report.downstream,
        idle = report.timed_out,
        "Connection closed"
    );
}
