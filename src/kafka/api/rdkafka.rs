//! Broker clients backed by librdkafka

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::ClientConfig;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::{
    ApiError, ApiMessage, ConsumerApi, DeliveryEvent, ProducerApi, RebalanceEvent,
    RebalanceHandler,
};
use crate::models::{CommitIntent, Offset};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A librdkafka log line
struct LogEvent {
    level: RDKafkaLogLevel,
    facility: String,
    message: String,
}

/// Forward librdkafka log lines to `tracing` until every sender is dropped
async fn drain_logs(mut logs: mpsc::UnboundedReceiver<LogEvent>) {
    while let Some(event) = logs.recv().await {
        let LogEvent {
            level,
            facility,
            message,
        } = event;
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = %facility, "{}", message),
            RDKafkaLogLevel::Warning => warn!(facility = %facility, "{}", message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(facility = %facility, "{}", message)
            }
            RDKafkaLogLevel::Debug => debug!(facility = %facility, "{}", message),
        }
    }
    trace!("librdkafka log drain finished");
}

/// Client context shared with librdkafka callbacks
pub struct BrokerContext {
    logs: mpsc::UnboundedSender<LogEvent>,
    on_rebalance: Arc<Mutex<Option<RebalanceHandler>>>,
}

impl ClientContext for BrokerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        let _ = self.logs.send(LogEvent {
            level,
            facility: fac.to_string(),
            message: log_message.to_string(),
        });
    }
}

impl ConsumerContext for BrokerContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let (event, tpl) = match rebalance {
            Rebalance::Assign(tpl) => (RebalanceEvent::AssignedPartitions, *tpl),
            Rebalance::Revoke(tpl) => (RebalanceEvent::RevokedPartitions, *tpl),
            _ => return,
        };

        let handler = self
            .on_rebalance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };

        let offsets: Vec<Offset> = tpl
            .elements()
            .iter()
            .map(|e| {
                Offset::new(
                    e.topic(),
                    e.partition(),
                    e.offset().to_raw().unwrap_or(-1),
                )
            })
            .collect();

        if let Err(e) = handler(event, &offsets) {
            warn!(event = %event, error = %e, "rebalance handler failed");
        }
    }
}

fn client_context() -> (BrokerContext, Arc<Mutex<Option<RebalanceHandler>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(drain_logs(rx));
    let on_rebalance = Arc::new(Mutex::new(None));
    (
        BrokerContext {
            logs: tx,
            on_rebalance: Arc::clone(&on_rebalance),
        },
        on_rebalance,
    )
}

fn api_message(msg: &BorrowedMessage<'_>) -> ApiMessage {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    ApiMessage {
        topic: msg.topic().to_string(),
        partition: Some(msg.partition()),
        offset: Some(msg.offset()),
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        headers,
    }
}

/// Consumer client over an rdkafka [`StreamConsumer`]
#[derive(Default)]
pub struct RdKafkaConsumer {
    consumer: Option<StreamConsumer<BrokerContext>>,
    on_rebalance: Arc<Mutex<Option<RebalanceHandler>>>,
}

impl RdKafkaConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn consumer(&self) -> Result<&StreamConsumer<BrokerContext>, ApiError> {
        self.consumer.as_ref().ok_or(ApiError::NotCreated)
    }
}

#[async_trait]
impl ConsumerApi for RdKafkaConsumer {
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError> {
        let (context, on_rebalance) = client_context();
        let consumer: StreamConsumer<BrokerContext> = config.create_with_context(context)?;
        self.consumer = Some(consumer);
        self.on_rebalance = on_rebalance;
        Ok(())
    }

    fn subscribe(
        &mut self,
        topics: &[String],
        on_rebalance: Option<RebalanceHandler>,
    ) -> Result<(), ApiError> {
        *self
            .on_rebalance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = on_rebalance;

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?.subscribe(&topics)?;
        Ok(())
    }

    fn assign(&mut self, topics: Option<&[String]>) -> Result<(), ApiError> {
        let consumer = self.consumer()?;
        let Some(topics) = topics else {
            consumer.unassign()?;
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        for topic in topics {
            let metadata = consumer.fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)?;
            for t in metadata.topics() {
                for p in t.partitions() {
                    tpl.add_partition_offset(t.name(), p.id(), rdkafka::Offset::Beginning)?;
                }
            }
        }
        consumer.assign(&tpl)?;
        Ok(())
    }

    async fn read_message(&mut self, timeout: Duration) -> Result<ApiMessage, ApiError> {
        let consumer = self.consumer()?;
        match tokio::time::timeout(timeout, consumer.recv()).await {
            Ok(Ok(msg)) => Ok(api_message(&msg)),
            Ok(Err(e)) => Err(ApiError::from(e)),
            Err(_) => Err(ApiError::Timeout),
        }
    }

    fn seek(&mut self, offset: &Offset, timeout: Duration) -> Result<(), ApiError> {
        self.consumer()?.seek(
            &offset.topic,
            offset.partition,
            rdkafka::Offset::Offset(offset.offset),
            timeout,
        )?;
        Ok(())
    }

    fn commit(&mut self, offset: &Offset, intent: CommitIntent) -> Result<(), ApiError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &offset.topic,
            offset.partition,
            rdkafka::Offset::Offset(intent.committed_offset(offset)),
        )?;
        self.consumer()?.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ApiError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}

/// Producer client over an rdkafka [`FutureProducer`]
///
/// Delivery reports for messages produced without their own channel go to a
/// shared event stream. Closing the client drops the stream's sender, so the
/// stream ends once the reports still in flight have arrived.
pub struct RdKafkaProducer {
    producer: Mutex<Option<FutureProducer>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<DeliveryEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryEvent>>>,
}

impl Default for RdKafkaProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl RdKafkaProducer {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            producer: Mutex::new(None),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn client(&self) -> Option<FutureProducer> {
        lock(&self.producer).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProducerApi for RdKafkaProducer {
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError> {
        *lock(&self.producer) = Some(config.create()?);
        Ok(())
    }

    fn produce(
        &self,
        message: ApiMessage,
        delivery: Option<oneshot::Sender<DeliveryEvent>>,
    ) -> Result<(), ApiError> {
        let producer = self.client().ok_or(ApiError::NotCreated)?;

        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&message.topic).headers(headers);
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }
        if let Some(value) = message.value.as_deref() {
            record = record.payload(value);
        }
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }

        let future = producer
            .send_result(record)
            .map_err(|(e, _)| ApiError::from(e))?;

        let events = match delivery {
            Some(_) => None,
            None => lock(&self.events_tx).clone(),
        };
        tokio::spawn(async move {
            let mut message = message;
            let event = match future.await {
                Ok(Ok(delivered)) => {
                    message.partition = Some(delivered.partition);
                    message.offset = Some(delivered.offset);
                    DeliveryEvent::Message {
                        message,
                        error: None,
                    }
                }
                Ok(Err((e, _))) => DeliveryEvent::Message {
                    message,
                    error: Some(ApiError::from(e)),
                },
                Err(_) => DeliveryEvent::Other("delivery report cancelled".to_string()),
            };
            match (delivery, events) {
                (Some(tx), _) => {
                    let _ = tx.send(event);
                }
                (None, Some(events)) => {
                    let _ = events.send(event);
                }
                (None, None) => trace!("delivery report after close dropped"),
            }
        });
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> usize {
        let Some(producer) = self.client() else {
            return 0;
        };
        if let Err(e) = producer.flush(timeout) {
            debug!(error = %e, "flush did not complete");
        }
        usize::try_from(producer.in_flight_count()).unwrap_or(0)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeliveryEvent>> {
        lock(&self.events_rx).take()
    }

    fn close(&self) {
        lock(&self.producer).take();
        lock(&self.events_tx).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_event_stream() {
        let mut api = RdKafkaProducer::new();
        api.create(ClientConfig::new().set("bootstrap.servers", "localhost:9092"))
            .unwrap();
        let mut events = api.take_events().unwrap();
        assert!(api.take_events().is_none());

        api.close();
        let next = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[test]
    fn test_produce_after_close() {
        let mut api = RdKafkaProducer::new();
        api.create(ClientConfig::new().set("bootstrap.servers", "localhost:9092"))
            .unwrap();
        api.close();

        let result = api.produce(ApiMessage::default(), None);
        assert!(matches!(result, Err(ApiError::NotCreated)));
        assert_eq!(api.flush(Duration::ZERO), 0);
    }
}
