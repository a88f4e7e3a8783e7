use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, NetworkOptions, Packet, QoS,
    TlsConfiguration, Transport as WireTransport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectOptions, Scheme};
use super::message_manager::MQTTMessage;
use super::{Transport, TransportError};
use crate::config::PublishOptions;
use crate::device::DeviceEvent;
use crate::error::{LinkError, LinkResult};

const REQUESTS_CAP: usize = 1024;

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// rumqttc client used by the dispatch engine
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Creates the client and spawns the task that drives its event loop.
    ///
    /// Inbound publishes, connection acknowledgements and connection errors are
    /// forwarded to `events`. After an error the poller waits for the reconnect
    /// period before polling again, which lets rumqttc re-establish the session.
    pub fn connect(
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<DeviceEvent>,
        cancel: CancellationToken,
    ) -> LinkResult<(Self, JoinHandle<()>)> {
        let mqtt_options = mqtt_options(options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUESTS_CAP);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs().max(1));
        event_loop.set_network_options(network);

        info!(
            "Connecting to MQTT broker {} as {}",
            options.broker.url, options.client_id
        );
        let poller = spawn_poller(event_loop, events, options.reconnect_period, cancel);
        Ok((MqttTransport { client }, poller))
    }
}

impl Transport for MqttTransport {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: String,
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos(options.qos), options.retain, payload.into_bytes())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request not sent: {}", e);
        }
    }
}

fn mqtt_options(options: &ConnectOptions) -> LinkResult<MqttOptions> {
    let mut mqtt_options = MqttOptions::new(
        options.client_id.clone(),
        options.broker.host.clone(),
        options.broker.port,
    );
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session)
        .set_last_will(LastWill::new(
            options.will.topic.clone(),
            options.will.payload.clone().into_bytes(),
            qos(options.will.qos),
            options.will.retain,
        ));

    if let Some(username) = &options.username {
        mqtt_options.set_credentials(
            username.clone(),
            options.password.clone().unwrap_or_default(),
        );
    }

    if options.broker.scheme == Scheme::Tls {
        mqtt_options.set_transport(WireTransport::Tls(tls_configuration(options)?));
    } else if options.cafile.is_some() || options.certfile.is_some() {
        warn!(
            "TLS files are configured but {} is not a TLS URL; connecting without TLS",
            options.broker.url
        );
    }

    Ok(mqtt_options)
}

fn read_file(path: &Path, what: &str) -> LinkResult<Vec<u8>> {
    fs::read(path).map_err(|e| LinkError::Tls(format!("Failed to read {} {}: {}", what, path.display(), e)))
}

fn tls_configuration(options: &ConnectOptions) -> LinkResult<TlsConfiguration> {
    let client_auth = match (&options.certfile, &options.keyfile) {
        (Some(cert), Some(key)) => Some((
            read_file(cert, "certificate")?,
            read_file(key, "private key")?,
        )),
        (None, None) => None,
        _ => {
            return Err(LinkError::Tls(
                "certfile and keyfile must be configured together".to_string(),
            ))
        }
    };

    if options.insecure {
        warn!("TLS server identity verification is disabled");
        return insecure_configuration(client_auth);
    }

    match (&options.cafile, client_auth) {
        (Some(ca), client_auth) => Ok(TlsConfiguration::Simple {
            ca: read_file(ca, "CA file")?,
            alpn: None,
            client_auth,
        }),
        (None, None) => Ok(TlsConfiguration::default()),
        (None, Some(_)) => Err(LinkError::Tls(
            "a cafile is required for client certificate authentication".to_string(),
        )),
    }
}

fn insecure_configuration(client_auth: Option<(Vec<u8>, Vec<u8>)>) -> LinkResult<TlsConfiguration> {
    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));

    let config = match client_auth {
        None => builder.with_no_client_auth(),
        Some((cert, key)) => {
            let certs = rustls_pemfile::certs(&mut BufReader::new(cert.as_slice()))
                .collect::<Result<Vec<CertificateDer<'static>>, _>>()
                .map_err(|e| LinkError::Tls(format!("Invalid client certificate: {}", e)))?;
            let key: PrivateKeyDer<'static> =
                rustls_pemfile::private_key(&mut BufReader::new(key.as_slice()))
                    .map_err(|e| LinkError::Tls(format!("Invalid private key: {}", e)))?
                    .ok_or_else(|| LinkError::Tls("No private key found in keyfile".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| LinkError::Tls(e.to_string()))?
        }
    };

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Verifier used for `insecure` connections: any server certificate is accepted.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn spawn_poller(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<DeviceEvent>,
    reconnect_period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("MQTT poller cancelled");
                    break;
                }
                polled = event_loop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => Some(DeviceEvent::Message(
                    MQTTMessage::from_topic(publish.topic, &publish.payload),
                )),
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to MQTT broker");
                    Some(DeviceEvent::Connected {
                        session_present: ack.session_present,
                    })
                }
                Ok(_) => None,
                Err(e) => {
                    error!("MQTT error: {}", e);
                    if events
                        .send(DeviceEvent::TransportError(e.to_string()))
                        .is_err()
                    {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_period) => {}
                    }
                    None
                }
            };

            if let Some(event) = event {
                if events.send(event).is_err() {
                    debug!("Device runtime gone, stopping MQTT poller");
                    break;
                }
            }
        }
    })
}
