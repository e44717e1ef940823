//! MQTT broker session.
//!
//! [`BrokerClient::connect`] retries the initial connection a bounded number of
//! times and fails hard when the budget is spent. [`BrokerClient::run`] then
//! polls the event loop, feeding every publish into the [`Dispatcher`].

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    Transport,
};
use std::time::Duration;
use tokio::sync::watch;

use crate::channel::Channel;
use crate::config::BrokerConfig;
use crate::dispatch::Dispatcher;

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Could not connect to MQTT broker after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: ConnectionError,
    },
    #[error("MQTT session lost: {0}")]
    Session(#[source] ConnectionError),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Connection state as seen by the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct BrokerClient {
    client: AsyncClient,
    eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    resume_after_disconnect: bool,
    retry_delay: Duration,
}

impl BrokerClient {
    /// Connect and subscribe to every channel topic.
    ///
    /// Makes up to `connect_retries` attempts, `retry_delay` apart.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }
        if config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let attempts = config.connect_retries.max(1);

        let mut attempt = 1;
        loop {
            state.send_replace(ConnectionState::Connecting);
            log::info!(
                "Connecting to MQTT broker {}:{} (attempt {}/{})",
                config.host,
                config.port,
                attempt,
                attempts
            );
            match wait_for_connack(&mut eventloop).await {
                Ok(()) => break,
                Err(e) => {
                    state.send_replace(ConnectionState::Disconnected);
                    if attempt >= attempts {
                        log::error!("Giving up on MQTT broker {}:{}: {}", config.host, config.port, e);
                        return Err(BrokerError::Connection { attempts, source: e });
                    }
                    log::warn!(
                        "MQTT connection attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        config.retry_delay()
                    );
                    tokio::time::sleep(config.retry_delay()).await;
                    attempt += 1;
                }
            }
        }

        let broker = Self {
            client,
            eventloop,
            state,
            resume_after_disconnect: config.resume_after_disconnect,
            retry_delay: config.retry_delay(),
        };
        subscribe_all(&broker.client).await?;
        broker.state.send_replace(ConnectionState::Connected);
        log::info!("Connected to MQTT broker {}:{}", config.host, config.port);
        Ok(broker)
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Poll the session until `shutdown` flips, the broker goes away, or the
    /// shutdown sender is dropped.
    ///
    /// A mid-session error ends the loop with [`BrokerError::Session`] unless
    /// `resume_after_disconnect` is set.
    pub async fn run(
        mut self,
        dispatcher: &Dispatcher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        log::debug!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                        dispatcher.dispatch(&publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("MQTT session re-established");
                        self.state.send_replace(ConnectionState::Connected);
                        subscribe_all(&self.client).await?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.state.send_replace(ConnectionState::Disconnected);
                        if !self.resume_after_disconnect {
                            log::error!("MQTT connection lost: {}", e);
                            return Err(BrokerError::Session(e));
                        }
                        log::warn!("MQTT connection lost: {}. Reconnecting in {:?}", e, self.retry_delay);
                        tokio::time::sleep(self.retry_delay).await;
                        self.state.send_replace(ConnectionState::Connecting);
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Send DISCONNECT and flush it out through the event loop.
    async fn shutdown(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Failed to queue MQTT disconnect: {}", e);
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            log::warn!("Timed out flushing MQTT disconnect");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        log::info!("Disconnected from MQTT broker");
    }
}

async fn subscribe_all(client: &AsyncClient) -> Result<()> {
    let filters = Channel::ALL
        .iter()
        .map(|c| SubscribeFilter::new(c.topic().to_string(), QoS::AtLeastOnce));
    client.subscribe_many(filters).await?;
    log::info!("Subscribed to {} telemetry topics", Channel::ALL.len());
    Ok(())
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        // Bind then drop to get a local port nothing is listening on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = BrokerConfig {
            host: "127.0.0.1".into(),
            port,
            connect_retries: 3,
            retry_delay_ms: 10,
            ..BrokerConfig::default()
        };

        let started = std::time::Instant::now();
        let err = BrokerClient::connect(&config).await.err().unwrap();
        match err {
            BrokerError::Connection { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        // two sleeps between three attempts
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
