//! Lazy connection and channel lifecycle.
//!
//! A [`ConnectionManager`] starts empty and opens its connection the first
//! time a channel is asked for. Whenever the connection or channel is later
//! found closed it is replaced transparently; connection failures while doing
//! so are retried according to the configured [`RetryPolicy`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use topiq_broker::{Channel, Connection, Connector, Endpoint};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Observable state of a [`ConnectionManager`], derived from the underlying
/// connection and channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection yet, or closed explicitly
    Disconnected,
    /// Connection and channel both open
    Connected,
    /// Connection or channel observed closed; recreated on next use
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Requests that a running consume loop stop and disconnect.
///
/// Cheap to clone and usable from any task. A request made while nothing is
/// consuming is honoured by the next consume call.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a close has been requested.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Clear a pending request, returning whether there was one.
    pub(crate) fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

/// Owns one broker connection and one channel on it.
///
/// Not meant for concurrent use; give each publisher or subscriber its own.
pub struct ConnectionManager {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    connection: Option<Box<dyn Connection>>,
    channel: Option<Box<dyn Channel>>,
    /// Bumped each time a fresh channel is opened
    channel_epoch: u64,
    close: CloseHandle,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, retry: RetryPolicy) -> Self {
        Self {
            endpoint,
            connector,
            retry,
            connection: None,
            channel: None,
            channel_epoch: 0,
            close: CloseHandle::default(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.connection, &self.channel) {
            (None, _) => ConnectionState::Disconnected,
            (Some(connection), Some(channel)) if connection.is_open() && channel.is_open() => {
                ConnectionState::Connected
            }
            _ => ConnectionState::Degraded,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of channels opened so far. Topology declared on one channel
    /// must be redeclared once this changes.
    pub fn channel_epoch(&self) -> u64 {
        self.channel_epoch
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Open the connection if there is none, or replace it if it was closed.
    pub async fn ensure_connection(&mut self) -> Result<()> {
        tracing::debug!("Ensuring connection to {} is ready", self.endpoint);
        let open = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_open());
        if open {
            return Ok(());
        }
        self.connect().await
    }

    /// Return an open channel, reconnecting or reopening as needed.
    pub async fn ensure_channel(&mut self) -> Result<&mut dyn Channel> {
        tracing::debug!("Ensuring channel is ready");
        self.ensure_connection().await?;

        if self.channel.as_ref().map_or(true, |channel| !channel.is_open()) {
            self.open_channel().await?;
        }

        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(Error::ConnectionFailure(
                "channel unavailable after reopening".to_string(),
            )),
        }
    }

    /// The current channel, whatever its state. Used by the consume loop,
    /// which must not swap channels under its consumers.
    pub(crate) fn current_channel(&mut self) -> Option<&mut dyn Channel> {
        match self.channel.as_deref_mut() {
            Some(channel) => Some(channel),
            None => None,
        }
    }

    /// Drop any existing connection and open a new one with a fresh channel,
    /// retrying connection failures per the retry policy.
    pub async fn connect(&mut self) -> Result<()> {
        let mut failed = 0u32;
        loop {
            self.release().await;

            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => {
                    failed = failed.saturating_add(1);
                    let Some(delay) = self.retry.delay_for(failed) else {
                        tracing::warn!(
                            "Giving up on {} after {} failed attempts: {}",
                            self.endpoint,
                            failed,
                            e
                        );
                        return Err(e);
                    };
                    tracing::warn!(
                        "Connection to {} failed (attempt {}): {}; retrying in {:?}",
                        self.endpoint,
                        failed,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort close of the channel and the connection. Leaves the
    /// manager disconnected; errors are logged and swallowed.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    tracing::debug!("Ignoring error while closing channel: {}", e);
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            tracing::info!("Closing connection to {}", self.endpoint);
            if let Err(e) = connection.close().await {
                tracing::debug!("Ignoring error while closing connection: {}", e);
            }
        }
    }

    async fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.is_open() {
                tracing::info!("Closing channel");
                if let Err(e) = channel.close().await {
                    tracing::debug!("Ignoring error while closing channel: {}", e);
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            if connection.is_open() {
                tracing::info!("Closing connection");
            }
            if let Err(e) = connection.close().await {
                tracing::debug!("Ignoring error while closing connection: {}", e);
            }
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        tracing::info!("Creating connection to {}", self.endpoint);
        let connection = self.connector.connect(&self.endpoint).await?;
        self.connection = Some(connection);
        self.open_channel().await
    }

    async fn open_channel(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailure("no connection to open a channel on".into()))?;

        tracing::info!("Opening channel");
        let mut channel = connection.open_channel().await?;
        tracing::info!("Setting channel to confirm delivery");
        channel.confirm_delivery().await?;

        self.channel = Some(channel);
        self.channel_epoch += 1;
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &self.state())
            .field("channel_epoch", &self.channel_epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use topiq_broker::{
        BrokerError, BrokerResult, ExchangeKind, MemoryBroker, Properties,
    };

    fn manager(broker: &MemoryBroker, retry: RetryPolicy) -> ConnectionManager {
        ConnectionManager::new(
            Endpoint::parse("memory://test").unwrap(),
            Arc::new(broker.clone()),
            retry,
        )
    }

    #[tokio::test]
    async fn test_lazy_connect() {
        let broker = MemoryBroker::new();
        let mut conn = manager(&broker, RetryPolicy::never());

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts(), 0);

        conn.ensure_channel().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.channel_epoch(), 1);

        conn.ensure_channel().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(conn.channel_epoch(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let broker = MemoryBroker::new();
        let mut conn = manager(&broker, RetryPolicy::never());
        conn.ensure_channel().await.unwrap();

        broker.drop_connections();
        assert_eq!(conn.state(), ConnectionState::Degraded);

        conn.ensure_channel().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(conn.channel_epoch(), 2);
        assert_eq!(broker.open_connection_count(), 1);
    }

    #[tokio::test]
    async fn test_reopens_closed_channel_on_same_connection() {
        let broker = MemoryBroker::new();
        let mut conn = manager(&broker, RetryPolicy::never());

        let channel = conn.ensure_channel().await.unwrap();
        let err = channel
            .basic_publish("missing", "a", &Properties::default(), b"", false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(conn.state(), ConnectionState::Degraded);

        let channel = conn.ensure_channel().await.unwrap();
        channel
            .exchange_declare("missing", ExchangeKind::Topic, true)
            .await
            .unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(conn.channel_epoch(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_broker_accepts() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(3);
        let mut conn = manager(&broker, RetryPolicy::default());

        let start = tokio::time::Instant::now();
        conn.ensure_channel().await.unwrap();

        assert_eq!(broker.connect_attempts(), 4);
        assert!(start.elapsed() >= Duration::from_secs(18));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_bounded_connect_gives_up() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(10);
        let mut conn = manager(&broker, RetryPolicy::bounded(3, Duration::ZERO));

        let err = conn.ensure_connection().await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    struct BrokenConnector;

    #[async_trait]
    impl Connector for BrokenConnector {
        async fn connect(&self, _endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>> {
            Err(BrokerError::Protocol("access refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let mut conn = ConnectionManager::new(
            Endpoint::parse("memory://test").unwrap(),
            Arc::new(BrokenConnector),
            RetryPolicy::default(),
        );

        let err = conn.ensure_channel().await.err().unwrap();
        assert!(matches!(err, Error::Broker(BrokerError::Protocol(_))));
    }

    /// Connections from a [`MemoryBroker`] whose `close` always fails.
    struct FailingClose(MemoryBroker);

    struct FailingCloseConnection(Box<dyn Connection>);

    #[async_trait]
    impl Connector for FailingClose {
        async fn connect(&self, endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>> {
            let inner = self.0.connect(endpoint).await?;
            Ok(Box::new(FailingCloseConnection(inner)))
        }
    }

    #[async_trait]
    impl Connection for FailingCloseConnection {
        fn is_open(&self) -> bool {
            self.0.is_open()
        }

        async fn open_channel(&mut self) -> BrokerResult<Box<dyn Channel>> {
            self.0.open_channel().await
        }

        async fn close(&mut self) -> BrokerResult<()> {
            Err(BrokerError::Protocol("close refused".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_close_errors_are_logged_on_reconnect() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let broker = MemoryBroker::new();
        let mut conn = ConnectionManager::new(
            Endpoint::parse("memory://test").unwrap(),
            Arc::new(FailingClose(broker.clone())),
            RetryPolicy::never(),
        );
        conn.ensure_channel().await.unwrap();

        broker.drop_connections();
        conn.ensure_channel().await.unwrap();

        assert!(conn.is_open());
        assert_eq!(broker.connect_attempts(), 2);
        assert!(logs
            .contents()
            .contains("Ignoring error while closing connection: Protocol error: close refused"));
    }

    #[tokio::test]
    async fn test_close_leaves_disconnected() {
        let broker = MemoryBroker::new();
        let mut conn = manager(&broker, RetryPolicy::never());
        conn.ensure_channel().await.unwrap();

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_connection_count(), 0);

        conn.close().await;
        conn.ensure_channel().await.unwrap();
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_close_handle_wakes_waiter() {
        let handle = CloseHandle::default();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(handle.take());
        assert!(!handle.is_requested());
    }
}
