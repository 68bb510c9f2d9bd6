/*
 * Copyright 2024 Thaddeus Treloar
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rdkafka::config::FromClientConfigAndContext;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext};
use tracing::{error, trace};

use crate::datastream::{ConnectionString, ConnectionStringError, Datastream};
use crate::message::ProducerRecord;

use super::{AckCallback, ProducerHandle, SendError};

#[derive(Debug, thiserror::Error)]
pub enum KafkaProducerError {
    #[error(transparent)]
    Connection(#[from] ConnectionStringError),
    #[error("failed to create producer: {0}")]
    CreateProducer(#[from] KafkaError),
}

/// [`ProducerHandle`] over a Kafka producer with a background delivery
/// thread. Delivery callbacks drive the per-record acks; failures since the
/// last flush are counted so `flush` can report them.
pub struct KafkaProducerHandle {
    producer: ThreadedProducer<AckContext>,
    failed_since_flush: Arc<AtomicUsize>,
}

impl KafkaProducerHandle {
    /// Producer for a datastream task, bootstrapped from the destination
    /// connection string. The topic component varies per record and is
    /// resolved in [`send`](ProducerHandle::send).
    pub fn from_datastream(datastream: &Datastream) -> Result<Self, KafkaProducerError> {
        let destination = datastream.destination_connection()?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", destination.bootstrap_servers())
            .set(
                "security.protocol",
                if destination.is_secure() {
                    "SSL"
                } else {
                    "PLAINTEXT"
                },
            );

        Self::from_client_config(&client_config)
    }

    pub fn from_client_config(client_config: &ClientConfig) -> Result<Self, KafkaProducerError> {
        let failed_since_flush = Arc::new(AtomicUsize::new(0));
        let context = AckContext {
            failed_since_flush: failed_since_flush.clone(),
        };

        Ok(Self {
            producer: ThreadedProducer::from_config_and_context(client_config, context)?,
            failed_since_flush,
        })
    }
}

impl ProducerHandle for KafkaProducerHandle {
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), SendError> {
        let destination: ConnectionString =
            record
                .destination()
                .parse()
                .map_err(|err: ConnectionStringError| SendError::Destination {
                    message: err.to_string(),
                })?;
        let topic = destination.name().to_owned();

        let state = Box::new(DeliveryState {
            ack,
            destination: record.destination().to_owned(),
        });

        let envelope = record.envelope();
        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliveryState>> =
            BaseRecord::with_opaque_to(&topic, state);

        if let Some(key) = envelope.key() {
            base = base.key(key);
        }
        if let Some(value) = envelope.value() {
            base = base.payload(value);
        }
        if let Some(partition) = record.partition() {
            base = base.partition(partition);
        }
        if let Some(headers) = envelope.headers() {
            let mut owned = OwnedHeaders::new();
            for (key, value) in headers {
                owned = owned.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                });
            }
            base = base.headers(owned);
        }
        base = base.timestamp(record.source_timestamp_ms());

        trace!("Queueing record for destination topic {}", topic);

        self.producer.send(base).map_err(|(err, _record)| {
            // never scheduled, so the ack will not fire; the caller retries
            SendError::Transient {
                destination: record.destination().to_owned(),
                message: err.to_string(),
            }
        })
    }

    fn flush(&self) -> Result<(), SendError> {
        self.producer
            .flush(Timeout::Never)
            .map_err(|err| SendError::Transient {
                destination: String::new(),
                message: err.to_string(),
            })?;

        let failures = self.failed_since_flush.swap(0, Ordering::SeqCst);
        if failures > 0 {
            return Err(SendError::FlushFailures { failures });
        }
        Ok(())
    }
}

struct DeliveryState {
    ack: AckCallback,
    destination: String,
}

struct AckContext {
    failed_since_flush: Arc<AtomicUsize>,
}

impl ClientContext for AckContext {}

impl ProducerContext for AckContext {
    type DeliveryOpaque = Box<DeliveryState>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let DeliveryState { ack, destination } = *delivery_opaque;

        match delivery_result {
            Ok(_) => ack(Ok(())),
            Err((err, _message)) => {
                self.failed_since_flush.fetch_add(1, Ordering::SeqCst);
                error!("Delivery to {} failed terminally: {}", destination, err);
                ack(Err(SendError::Delivery {
                    destination,
                    message: err.to_string(),
                }));
            }
        }
    }
}
