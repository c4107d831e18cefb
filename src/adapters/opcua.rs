//! OPC UA protocol adapter
//!
//! Reads use `ReadNodes` with per-tag status codes mapped to quality; a
//! node-id cache avoids re-parsing address strings on every poll. Devices
//! may opt into subscription mode instead, where the adapter creates a
//! server subscription and every data-change notification becomes an
//! immediately forwarded DataPoint (the device is then excluded from
//! polling).

use super::{ProtocolAdapter, ProtocolError};
use crate::config::OpcuaConfig;
use crate::model::{DataPoint, DataType, Device, Quality, Tag, TagValue};
use crate::point_pool::PointPool;
use async_trait::async_trait;
use chrono::Utc;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Map an OPC UA status code onto the pipeline quality enum
pub fn map_status_to_quality(status: StatusCode) -> Quality {
    if status.is_good() {
        Quality::Good
    } else if status.is_bad() {
        Quality::Bad
    } else {
        Quality::Uncertain
    }
}

/// Extract a numeric value from a Variant
pub fn extract_numeric_value(variant: &Variant) -> Option<f64> {
    match variant {
        Variant::Double(v) => Some(*v),
        Variant::Float(v) => Some(*v as f64),
        Variant::Int64(v) => Some(*v as f64),
        Variant::UInt64(v) => Some(*v as f64),
        Variant::Int32(v) => Some(*v as f64),
        Variant::UInt32(v) => Some(*v as f64),
        Variant::Int16(v) => Some(*v as f64),
        Variant::UInt16(v) => Some(*v as f64),
        Variant::SByte(v) => Some(*v as f64),
        Variant::Byte(v) => Some(*v as f64),
        Variant::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Encode an unscaled write value as the Variant the tag's type expects
fn encode_variant(tag: &Tag, value: &TagValue, raw: Option<f64>) -> Result<Variant, ProtocolError> {
    let numeric = |raw: Option<f64>| {
        raw.ok_or_else(|| ProtocolError::TypeMismatch(format!("{} expects a number", tag.name)))
    };
    Ok(match tag.data_type {
        DataType::Bool => match value {
            TagValue::Bool(b) => Variant::Boolean(*b),
            other => Variant::Boolean(other.as_f64().map(|v| v != 0.0).unwrap_or(false)),
        },
        DataType::String => match value {
            TagValue::Text(s) => Variant::String(UAString::from(s.as_str())),
            other => {
                return Err(ProtocolError::TypeMismatch(format!(
                    "{} expects a string, got {:?}",
                    tag.name, other
                )))
            }
        },
        DataType::Int16 => Variant::Int16(numeric(raw)?.round() as i16),
        DataType::Uint16 => Variant::UInt16(numeric(raw)?.round() as u16),
        DataType::Int32 => Variant::Int32(numeric(raw)?.round() as i32),
        DataType::Uint32 => Variant::UInt32(numeric(raw)?.round() as u32),
        DataType::Int64 => Variant::Int64(numeric(raw)?.round() as i64),
        DataType::Uint64 => Variant::UInt64(numeric(raw)?.round() as u64),
        DataType::Float32 => Variant::Float(numeric(raw)? as f32),
        DataType::Float64 => Variant::Double(numeric(raw)?),
    })
}

fn message_security_mode(device: &Device) -> MessageSecurityMode {
    match device.security_mode.as_deref() {
        Some("Sign") => MessageSecurityMode::Sign,
        Some("SignAndEncrypt") => MessageSecurityMode::SignAndEncrypt,
        _ => MessageSecurityMode::None,
    }
}

fn identity_token(device: &Device) -> IdentityToken {
    match (&device.username, &device.password) {
        (Some(user), Some(pass)) => IdentityToken::UserName(user.clone(), pass.clone()),
        _ => IdentityToken::Anonymous,
    }
}

fn build_client(config: &OpcuaConfig) -> Result<Client, ProtocolError> {
    ClientBuilder::new()
        .application_name("Nexus Protocol Gateway")
        .application_uri("urn:Nexus:Gateway")
        .pki_dir("./pki")
        .trust_server_certs(true)
        .session_retry_limit(config.pool.retry_attempts as i32)
        .client()
        .ok_or_else(|| ProtocolError::ConnectionFailed("failed to build OPC UA client".into()))
}

fn connect_session(
    device: &Device,
    config: &OpcuaConfig,
) -> Result<Arc<RwLock<Session>>, ProtocolError> {
    let endpoint_url = device
        .endpoint_url
        .clone()
        .ok_or_else(|| ProtocolError::InvalidConfiguration("endpoint_url not set".into()))?;
    let policy = device
        .security_policy
        .clone()
        .unwrap_or_else(|| SecurityPolicy::None.to_str().to_string());
    let mode = message_security_mode(device);

    let mut client = build_client(config)?;
    client
        .connect_to_endpoint(
            (
                endpoint_url.as_str(),
                policy.as_str(),
                mode,
                UserTokenPolicy::anonymous(),
            ),
            identity_token(device),
        )
        .map_err(|status| {
            ProtocolError::ConnectionFailed(format!("endpoint {endpoint_url}: {status}"))
        })
}

/// Polling-path adapter, one session per device endpoint
pub struct OpcuaAdapter {
    device: Arc<Device>,
    config: OpcuaConfig,
    points: Arc<PointPool>,
    session: Option<Arc<RwLock<Session>>>,
    /// Parsed node ids keyed by address string
    node_cache: HashMap<String, NodeId>,
}

impl OpcuaAdapter {
    pub fn new(device: Arc<Device>, config: OpcuaConfig, points: Arc<PointPool>) -> Self {
        Self {
            device,
            config,
            points,
            session: None,
            node_cache: HashMap::new(),
        }
    }

    fn node_id(&mut self, address: &str) -> Result<NodeId, ProtocolError> {
        if let Some(node) = self.node_cache.get(address) {
            return Ok(node.clone());
        }
        let node = NodeId::from_str(address)
            .map_err(|_| ProtocolError::InvalidAddress(format!("bad node id {address:?}")))?;
        self.node_cache.insert(address.to_string(), node.clone());
        Ok(node)
    }

    fn fill_point(&self, tag: &Tag, data_value: Option<&DataValue>) -> DataPoint {
        let mut dp = self.points.acquire();
        dp.device_id = self.device.id.clone();
        dp.tag_id = tag.id.clone();
        dp.topic = tag.topic(&self.device.uns_prefix);
        dp.unit = tag.unit.clone();
        dp.ts = Utc::now();

        match data_value {
            None => dp.quality = Quality::Bad,
            Some(dv) => {
                dp.quality = dv
                    .status
                    .map(map_status_to_quality)
                    .unwrap_or(Quality::Good);
                dp.source_ts = dv.source_timestamp.as_ref().map(|t| t.as_chrono());
                dp.server_ts = dv.server_timestamp.as_ref().map(|t| t.as_chrono());
                if dp.quality != Quality::Bad {
                    match dv.value.as_ref() {
                        Some(Variant::String(s)) if tag.data_type == DataType::String => {
                            dp.value_str = Some(s.to_string());
                        }
                        Some(v) => match extract_numeric_value(v) {
                            Some(raw) => {
                                dp.raw_value = Some(raw);
                                dp.value = Some(tag.scale_value(raw));
                                dp.is_bool = tag.data_type == DataType::Bool;
                            }
                            None => dp.quality = Quality::Bad,
                        },
                        None => dp.quality = Quality::Bad,
                    }
                }
            }
        }
        dp
    }
}

#[async_trait]
impl ProtocolAdapter for OpcuaAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        info!(
            device_id = %self.device.id,
            endpoint = %self.device.endpoint_url.as_deref().unwrap_or(""),
            "Connecting to OPC UA server"
        );
        let device = self.device.clone();
        let config = self.config.clone();
        let session =
            tokio::task::spawn_blocking(move || connect_session(&device, &config))
                .await
                .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))??;
        self.session = Some(session);
        Ok(())
    }

    async fn read_tags(
        &mut self,
        device: &Device,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, ProtocolError> {
        debug_assert_eq!(device.id, self.device.id);
        let session = self.session.clone().ok_or(ProtocolError::NotConnected)?;

        let mut reads = Vec::with_capacity(tags.len());
        let mut unresolved = Vec::new();
        for (idx, tag) in tags.iter().enumerate() {
            match self.node_id(&tag.address) {
                Ok(node) => reads.push((idx, ReadValueId::from(node))),
                Err(_) => unresolved.push(idx),
            }
        }

        let ids: Vec<ReadValueId> = reads.iter().map(|(_, r)| r.clone()).collect();
        let values = tokio::task::spawn_blocking(move || {
            let session = session.read();
            session.read(&ids, TimestampsToReturn::Both, 0.0)
        })
        .await
        .map_err(|e| ProtocolError::ReadFailed(e.to_string()))?
        .map_err(|status| {
            if status == StatusCode::BadConnectionClosed
                || status == StatusCode::BadSessionIdInvalid
                || status == StatusCode::BadNotConnected
            {
                ProtocolError::ConnectionLost(status.to_string())
            } else {
                ProtocolError::ReadFailed(status.to_string())
            }
        });

        let values = match values {
            Ok(v) => v,
            Err(e @ ProtocolError::ConnectionLost(_)) => {
                self.session = None;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut points: Vec<Option<DataPoint>> = (0..tags.len()).map(|_| None).collect();
        for ((idx, _), dv) in reads.iter().zip(values.iter()) {
            points[*idx] = Some(self.fill_point(&tags[*idx], Some(dv)));
        }
        for idx in unresolved {
            points[idx] = Some(self.fill_point(&tags[idx], None));
        }
        Ok(points.into_iter().flatten().collect())
    }

    async fn write_tag(
        &mut self,
        _device: &Device,
        tag: &Tag,
        value: &TagValue,
    ) -> Result<(), ProtocolError> {
        if !tag.writable {
            return Err(ProtocolError::NotWritable(tag.name.clone()));
        }
        let session = self.session.clone().ok_or(ProtocolError::NotConnected)?;
        let node = self.node_id(&tag.address)?;

        let raw = value.as_f64().map(|v| tag.unscale_value(v));
        let variant = encode_variant(tag, value, raw)?;
        let write_value = WriteValue {
            node_id: node,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::value_only(variant),
        };

        let results = tokio::task::spawn_blocking(move || {
            let session = session.read();
            session.write(&[write_value])
        })
        .await
        .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?
        .map_err(|status| ProtocolError::WriteFailed(status.to_string()))?;

        match results.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(ProtocolError::WriteFailed(status.to_string())),
            None => Err(ProtocolError::WriteFailed("empty write response".into())),
        }
    }

    async fn ping(&mut self) -> Result<(), ProtocolError> {
        let session = self.session.clone().ok_or(ProtocolError::NotConnected)?;
        // ServerStatus_State; cheapest round trip the server must answer
        let state: NodeId = VariableId::Server_ServerStatus_State.into();
        let result = tokio::task::spawn_blocking(move || {
            let session = session.read();
            session.read(&[ReadValueId::from(state)], TimestampsToReturn::Neither, 0.0)
        })
        .await
        .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))?;
        match result {
            Ok(_) => Ok(()),
            Err(status) => {
                self.session = None;
                Err(ProtocolError::ConnectionLost(status.to_string()))
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(session) = self.session.take() {
            tokio::task::spawn_blocking(move || {
                session.write().disconnect();
            })
            .await
            .ok();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn protocol_name(&self) -> &'static str {
        "opcua"
    }
}

/// Handle to a running subscription-mode session
pub struct SubscriptionHandle {
    session: Arc<RwLock<Session>>,
    pub device_id: String,
}

impl SubscriptionHandle {
    pub fn stop(&self) {
        self.session.write().disconnect();
    }
}

/// Connect a subscription-mode device: every data change is converted into a
/// DataPoint and sent on `tx` immediately. Returns after the subscription is
/// established; the session's publish loop runs on its own thread.
pub async fn spawn_subscription(
    device: Arc<Device>,
    config: OpcuaConfig,
    points: Arc<PointPool>,
    tx: mpsc::Sender<DataPoint>,
) -> Result<SubscriptionHandle, ProtocolError> {
    let dev = device.clone();
    let cfg = config.clone();
    let session = tokio::task::spawn_blocking(move || connect_session(&dev, &cfg))
        .await
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))??;

    // handle → tag mapping for the data-change callback
    let mut by_handle: HashMap<u32, Tag> = HashMap::new();
    let mut items: Vec<MonitoredItemCreateRequest> = Vec::with_capacity(device.tags.len());
    for (i, tag) in device.tags.iter().enumerate() {
        let node = NodeId::from_str(&tag.address)
            .map_err(|_| ProtocolError::InvalidAddress(format!("bad node id {:?}", tag.address)))?;
        let client_handle = (i + 1) as u32;
        let mut request: MonitoredItemCreateRequest = node.into();
        request.requested_parameters.client_handle = client_handle;
        request.requested_parameters.sampling_interval = config.sampling_interval_ms as f64;
        if let Some(deadband) = tag.deadband_absolute.or(tag.deadband_percent) {
            let deadband_type = if tag.deadband_absolute.is_some() {
                DeadbandType::Absolute
            } else {
                DeadbandType::Percent
            };
            let filter = DataChangeFilter {
                trigger: DataChangeTrigger::StatusValue,
                deadband_type: deadband_type as u32,
                deadband_value: deadband,
            };
            request.requested_parameters.filter = ExtensionObject::from_encodable(
                ObjectId::DataChangeFilter_Encoding_DefaultBinary,
                &filter,
            );
        }
        by_handle.insert(client_handle, tag.clone());
        items.push(request);
    }

    let callback_device = device.clone();
    let callback = DataChangeCallback::new(move |changed_items| {
        for item in changed_items.iter() {
            let handle = item.client_handle();
            let Some(tag) = by_handle.get(&handle) else {
                continue;
            };
            let dv = item.last_value();
            let mut dp = points.acquire();
            dp.device_id = callback_device.id.clone();
            dp.tag_id = tag.id.clone();
            dp.topic = tag.topic(&callback_device.uns_prefix);
            dp.unit = tag.unit.clone();
            dp.ts = Utc::now();
            dp.quality = dv
                .status
                .map(map_status_to_quality)
                .unwrap_or(Quality::Good);
            dp.source_ts = dv.source_timestamp.as_ref().map(|t| t.as_chrono());
            dp.server_ts = dv.server_timestamp.as_ref().map(|t| t.as_chrono());
            match dv.value.as_ref() {
                Some(Variant::String(s)) if tag.data_type == DataType::String => {
                    dp.value_str = Some(s.to_string());
                }
                Some(v) => match extract_numeric_value(v) {
                    Some(raw) => {
                        dp.raw_value = Some(raw);
                        dp.value = Some(tag.scale_value(raw));
                        dp.is_bool = tag.data_type == DataType::Bool;
                    }
                    None => dp.quality = Quality::Bad,
                },
                None => dp.quality = Quality::Bad,
            }
            if tx.blocking_send(dp).is_err() {
                error!(device_id = %callback_device.id, "Publisher channel closed, dropping data change");
            }
        }
    });

    let (subscription_id, created) = {
        let s = session.read();
        let subscription_id = s
            .create_subscription(
                config.publish_interval_ms as f64,
                // lifetime and keep-alive counts per OPC UA part 4 defaults
                30,
                10,
                0,
                0,
                true,
                callback,
            )
            .map_err(|status| ProtocolError::ConnectionFailed(status.to_string()))?;
        let created = s
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, &items)
            .map_err(|status| ProtocolError::ConnectionFailed(status.to_string()))?;
        (subscription_id, created)
    };

    let failed = created
        .iter()
        .filter(|r| !r.status_code.is_good())
        .count();
    if failed > 0 {
        warn!(
            device_id = %device.id,
            failed,
            total = device.tags.len(),
            "Some monitored items were rejected by the server"
        );
    }
    debug!(
        device_id = %device.id,
        subscription_id,
        "OPC UA subscription established"
    );

    // publish loop; returns when the session disconnects
    let run_session = session.clone();
    let device_id = device.id.clone();
    std::thread::spawn(move || {
        Session::run(run_session);
        info!(device_id = %device_id, "OPC UA subscription session ended");
    });

    Ok(SubscriptionHandle {
        session,
        device_id: device.id.clone(),
    })
}
