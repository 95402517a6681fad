//! A fake Kafka wire codec and in-process broker, used to drive connector,
//! dispatcher and router tests without a real Kafka cluster. The wire format
//! here is a length-prefixed JSON envelope private to this crate's tests —
//! it stands in for the out-of-scope real protocol codec.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::wire::KafkaWire;
use crate::wire::PartitionAck;
use crate::wire::ProduceResponse;
use crate::wire::TAllTopics;
use crate::wire::TopicAck;
use crate::wire::WireCompression;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireRequestPartition {
    pub partition: i32,
    pub message_count: usize,
    pub compressed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireRequestTopic {
    pub topic: String,
    pub partitions: Vec<WireRequestPartition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireRequest {
    pub correlation_id: i32,
    pub client_id: String,
    pub required_acks: i16,
    pub replication_timeout_ms: i32,
    pub topics: Vec<WireRequestTopic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireResponsePartition {
    pub partition: i32,
    pub error_code: i16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireResponseTopic {
    pub topic: String,
    pub partitions: Vec<WireResponsePartition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireResponse {
    pub correlation_id: i32,
    pub topics: Vec<WireResponseTopic>,
}

/// A produce response that acks every partition of the request it answers
/// with error code 0.
pub fn ack_all(request: &WireRequest) -> WireResponse {
    WireResponse {
        correlation_id: request.correlation_id,
        topics: request
            .topics
            .iter()
            .map(|t| WireResponseTopic {
                topic: t.topic.clone(),
                partitions: t.partitions.iter().map(|p| WireResponsePartition { partition: p.partition, error_code: 0 }).collect(),
            })
            .collect(),
    }
}

/// The narrow wire port implemented against the private JSON test envelope
/// instead of real Kafka framing.
#[derive(Default)]
pub struct FakeWire;

impl FakeWire {
    fn write_frame(bytes: Vec<u8>) -> Vec<u8> {
        let mut framed = Vec::with_capacity(bytes.len() + 4);
        framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        framed.extend_from_slice(&bytes);
        framed
    }
}

impl KafkaWire for FakeWire {
    fn single_msg_overhead(&self) -> usize {
        12
    }

    fn encode_produce_request(
        &self,
        correlation_id: i32,
        client_id: &str,
        required_acks: i16,
        replication_timeout_ms: i32,
        all_topics: &TAllTopics,
        compressed: &std::collections::BTreeMap<(String, i32), (WireCompression, Vec<u8>)>,
    ) -> Vec<u8> {
        let topics = all_topics
            .iter()
            .map(|(topic, partitions)| WireRequestTopic {
                topic: topic.clone(),
                partitions: partitions
                    .iter()
                    .map(|(&partition, set)| WireRequestPartition {
                        partition,
                        message_count: set.messages.len(),
                        compressed: compressed.contains_key(&(topic.clone(), partition)),
                    })
                    .collect(),
            })
            .collect();
        let request = WireRequest {
            correlation_id,
            client_id: client_id.to_string(),
            required_acks,
            replication_timeout_ms,
            topics,
        };
        let body = serde_json::to_vec(&request).expect("fake wire request is always serializable");
        Self::write_frame(body)
    }

    fn compress(&self, codec: WireCompression, level: Option<u32>, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        match codec {
            WireCompression::None => Ok(payload.to_vec()),
            WireCompression::Gzip => {
                use flate2::write::GzEncoder;
                use flate2::Compression;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.unwrap_or(6)));
                encoder.write_all(payload)?;
                encoder.finish()
            }
            WireCompression::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(payload).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
            WireCompression::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
        }
    }

    fn encode_msg_set_payload(&self, messages: &[crate::message::Message]) -> Vec<u8> {
        let mut payload = Vec::new();
        for msg in messages {
            if let Some(key) = &msg.key {
                payload.extend_from_slice(key);
            }
            payload.extend_from_slice(&msg.value);
        }
        payload
    }

    fn decode_produce_response(&self, bytes: &[u8]) -> Option<ProduceResponse> {
        let response: WireResponse = serde_json::from_slice(bytes).ok()?;
        Some(ProduceResponse {
            correlation_id: response.correlation_id,
            topics: response
                .topics
                .into_iter()
                .map(|t| TopicAck {
                    topic: t.topic,
                    partitions: t.partitions.into_iter().map(|p| PartitionAck { partition: p.partition, error_code: p.error_code }).collect(),
                })
                .collect(),
        })
    }

    fn make_metadata_request(&self, topics: Option<&[String]>) -> Vec<u8> {
        let body = serde_json::json!({ "kind": "metadata", "topics": topics });
        Self::write_frame(serde_json::to_vec(&body).unwrap())
    }

    fn make_topic_autocreate_request(&self, topic: &str) -> Vec<u8> {
        let body = serde_json::json!({ "kind": "autocreate", "topic": topic });
        Self::write_frame(serde_json::to_vec(&body).unwrap())
    }

    fn decode_metadata_response(&self, bytes: &[u8]) -> Option<crate::wire::RawMetadata> {
        let response: WireMetadataResponse = serde_json::from_slice(bytes).ok()?;
        Some(crate::wire::RawMetadata {
            brokers: response
                .brokers
                .into_iter()
                .map(|b| crate::wire::RawBroker { id: b.id, host: b.host, port: b.port })
                .collect(),
            topics: response
                .topics
                .into_iter()
                .map(|t| crate::wire::RawTopic {
                    name: t.name,
                    partitions: t
                        .partitions
                        .into_iter()
                        .map(|p| crate::wire::RawPartition {
                            id: p.id,
                            leader_broker_id: p.leader_broker_id,
                            error_code: p.error_code,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    fn decode_autocreate_response(&self, bytes: &[u8]) -> Option<crate::wire::AutocreateOutcome> {
        let response: WireAutocreateResponse = serde_json::from_slice(bytes).ok()?;
        match response.outcome.as_str() {
            "success" => Some(crate::wire::AutocreateOutcome::Success),
            "fail" => Some(crate::wire::AutocreateOutcome::Fail),
            "try_other_broker" => Some(crate::wire::AutocreateOutcome::TryOtherBroker),
            _ => None,
        }
    }
}

/// An in-process broker: accepts one connection at a time and answers each
/// length-prefixed request by calling `responder`. Used to drive the
/// connector's real `TcpStream` read/write loop in tests.
pub struct FakeBroker {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeBroker {
    pub fn start<F>(responder: F) -> FakeBroker
    where
        F: Fn(&WireRequest) -> WireResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake broker");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let responder = Arc::new(responder);
        let handle = thread::spawn(move || Self::accept_loop(listener, shutdown_clone, responder));
        FakeBroker { addr, shutdown, handle: Some(handle) }
    }

    fn accept_loop<F>(listener: TcpListener, shutdown: Arc<AtomicBool>, responder: Arc<F>)
    where
        F: Fn(&WireRequest) -> WireResponse + Send + Sync + 'static,
    {
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let shutdown = shutdown.clone();
                    let responder = responder.clone();
                    thread::spawn(move || Self::serve(stream, shutdown, responder));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
    }

    fn serve<F>(mut stream: TcpStream, shutdown: Arc<AtomicBool>, responder: Arc<F>)
    where
        F: Fn(&WireRequest) -> WireResponse + Send + Sync + 'static,
    {
        stream.set_nonblocking(false).ok();
        stream.set_read_timeout(Some(Duration::from_millis(200))).ok();
        while !shutdown.load(Ordering::Relaxed) {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).is_err() {
                continue;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).is_err() {
                return;
            }
            let request: WireRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let response = responder(&request);
            let encoded = serde_json::to_vec(&response).expect("fake wire response is always serializable");
            let mut framed = Vec::with_capacity(encoded.len() + 4);
            framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            framed.extend_from_slice(&encoded);
            if stream.write_all(&framed).is_err() {
                return;
            }
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMetadataBroker {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMetadataPartition {
    pub id: i32,
    pub leader_broker_id: i32,
    pub error_code: i16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMetadataTopic {
    pub name: String,
    pub partitions: Vec<WireMetadataPartition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMetadataResponse {
    pub brokers: Vec<WireMetadataBroker>,
    pub topics: Vec<WireMetadataTopic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireAutocreateResponse {
    pub outcome: String,
}

/// A broker stand-in for the router's bootstrap/metadata-refresh/autocreate
/// requests, which use a different envelope shape than produce traffic.
/// Kept separate from [`FakeBroker`] rather than folded into it since the
/// two request families share nothing but the length-prefix framing.
pub struct FakeControlBroker {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeControlBroker {
    /// `responder` receives the decoded request envelope and returns the
    /// unframed JSON response body.
    pub fn start<F>(responder: F) -> FakeControlBroker
    where
        F: Fn(serde_json::Value) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake control broker");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let responder = Arc::new(responder);
        let handle = thread::spawn(move || Self::accept_loop(listener, shutdown_clone, responder));
        FakeControlBroker { addr, shutdown, handle: Some(handle) }
    }

    fn accept_loop<F>(listener: TcpListener, shutdown: Arc<AtomicBool>, responder: Arc<F>)
    where
        F: Fn(serde_json::Value) -> Vec<u8> + Send + Sync + 'static,
    {
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let shutdown = shutdown.clone();
                    let responder = responder.clone();
                    thread::spawn(move || Self::serve(stream, shutdown, responder));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
    }

    fn serve<F>(mut stream: TcpStream, shutdown: Arc<AtomicBool>, responder: Arc<F>)
    where
        F: Fn(serde_json::Value) -> Vec<u8> + Send + Sync + 'static,
    {
        stream.set_nonblocking(false).ok();
        stream.set_read_timeout(Some(Duration::from_millis(200))).ok();
        while !shutdown.load(Ordering::Relaxed) {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).is_err() {
                continue;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).is_err() {
                return;
            }
            let request: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let encoded = responder(request);
            let mut framed = Vec::with_capacity(encoded.len() + 4);
            framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            framed.extend_from_slice(&encoded);
            if stream.write_all(&framed).is_err() {
                return;
            }
        }
    }
}

impl Drop for FakeControlBroker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
